//! Transcoding orchestrator.
//!
//! [`Transcoder::transcode`] turns one source into one (variant, format)
//! output. Each call walks a small state machine:
//!
//! ```text
//! candidate_selection ──► admission_check ──► encode_attempt ──► success
//!        ▲                      │                   │
//!        │                 resource veto       failure / empty
//!        │                 (abort call)             │
//!        │                                          ▼
//!        └──── next format ◄── exhausted ◄── next candidate
//! ```
//!
//! - Drivers are tried in configured priority order; the first success wins.
//! - A resource-class failure (`resource_limit_exceeded`,
//!   `memory_limit_exceeded`, `image_too_large`, `invalid_source`) ends the
//!   call at once. Dimensions do not change between drivers.
//! - Any other encode failure, including zero-byte output, is recorded and
//!   the next candidate is tried.
//! - When every driver for a format failed, the next untried format of the
//!   fallback chain gets a fresh candidate loop.
//! - Nothing succeeded: `all_drivers_failed`, carrying every attempt.
//!
//! Every fallback is logged at `warn` and reported to the
//! [`FallbackObserver`].

use crate::config::{TranscodeConfig, VariantSpec};
use crate::error::{AttemptRecord, ErrorKind, TranscodingFailure};
use crate::events::{FallbackCounter, FallbackEvent, FallbackObserver};
use crate::imaging::{DriverId, EncodeRequest, Format, Quality};
use crate::limits::{ResourceLimitGuard, ResourceLimits};
use crate::analyzer::DimensionAnalyzer;
use crate::registry::DriverRegistry;
use crate::source::SourceImage;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A successful transcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    /// The format actually produced.
    pub format: Format,
    pub requested_format: Format,
    pub driver: DriverId,
    pub width: u32,
    pub height: u32,
    /// Whether any driver or format fallback happened on the way.
    pub fallback_used: bool,
}

/// Drives registry, guard and drivers for single transcodes.
///
/// Apart from the fallback counters it holds no mutable state across calls;
/// share one instance between worker threads.
pub struct Transcoder {
    registry: Arc<DriverRegistry>,
    guard: ResourceLimitGuard,
    quality: Quality,
    counter: FallbackCounter,
    observer: Option<Arc<dyn FallbackObserver>>,
}

impl Transcoder {
    pub fn new(registry: Arc<DriverRegistry>, quality: Quality) -> Self {
        let analyzer = DimensionAnalyzer::new(Arc::clone(&registry));
        Self {
            registry,
            guard: ResourceLimitGuard::new(analyzer),
            quality,
            counter: FallbackCounter::new(),
            observer: None,
        }
    }

    pub fn from_config(registry: Arc<DriverRegistry>, config: &TranscodeConfig) -> Self {
        let analyzer = DimensionAnalyzer::new(Arc::clone(&registry))
            .with_square_tolerance(config.analysis.square_tolerance);
        Self {
            guard: ResourceLimitGuard::new(analyzer),
            ..Self::new(registry, config.quality())
        }
    }

    /// Also report every fallback to `observer`. The built-in counter keeps
    /// counting either way.
    pub fn with_observer(mut self, observer: Arc<dyn FallbackObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Fallbacks taken by this transcoder since construction.
    pub fn fallback_counter(&self) -> &FallbackCounter {
        &self.counter
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn analyzer(&self) -> &DimensionAnalyzer {
        self.guard.analyzer()
    }

    pub fn guard(&self) -> &ResourceLimitGuard {
        &self.guard
    }

    /// Produce `variant` of `source` as `format`, or the first format down
    /// the fallback chain that some driver can produce.
    pub fn transcode(
        &self,
        source: &SourceImage,
        variant: &VariantSpec,
        format: Format,
        limits: &ResourceLimits,
    ) -> Result<EncodedImage, TranscodingFailure> {
        if self.registry.candidates_for_format(format).is_none() {
            error!(source = source.id(), %format, "no driver can produce format or any fallback");
            return Err(TranscodingFailure::new(
                ErrorKind::AllDriversFailed,
                format!("no driver can produce {format} or any fallback format"),
            )
            .with_context("source", source.id())
            .with_context("variant", &variant.name)
            .with_context("format", format));
        }

        let plan: Vec<Format> = std::iter::once(format)
            .chain(self.registry.fallback_chain(format))
            .collect();
        let mut attempted: BTreeSet<Format> = BTreeSet::new();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_format = format;

        for current in plan {
            if !attempted.insert(current) {
                continue;
            }
            let candidates = self.registry.drivers_for(current);
            if candidates.is_empty() {
                debug!(format = %current, "no driver for format, skipping");
                continue;
            }
            if current != last_format {
                self.report(FallbackEvent::Format {
                    from: last_format,
                    to: current,
                });
            }
            debug!(format = %current, candidates = ?candidates, "candidate selection");

            let mut failed: Option<(DriverId, ErrorKind)> = None;
            for id in candidates {
                let Some(driver) = self.registry.driver(id) else {
                    continue;
                };
                if let Some((from, kind)) = failed.take() {
                    self.report(FallbackEvent::Driver {
                        from,
                        to: id,
                        format: current,
                        kind,
                    });
                }

                let dims = self.guard.check(source, driver, limits).map_err(|failure| {
                    warn!(
                        source = source.id(),
                        driver = %id,
                        kind = %failure.kind(),
                        "admission rejected: {}",
                        failure.description()
                    );
                    failure
                        .with_context("variant", &variant.name)
                        .with_context("format", current)
                })?;

                let target = variant.target(dims);
                let request = EncodeRequest::new(current, target, self.quality);
                let (kind, message) = match driver.encode(source.bytes(), &request) {
                    Ok(bytes) if !bytes.is_empty() => {
                        info!(
                            source = source.id(),
                            variant = %variant.name,
                            format = %current,
                            driver = %id,
                            dimensions = %target,
                            bytes = bytes.len(),
                            "transcoded"
                        );
                        return Ok(EncodedImage {
                            bytes,
                            format: current,
                            requested_format: format,
                            driver: id,
                            width: target.width,
                            height: target.height,
                            fallback_used: current != format || !attempts.is_empty(),
                        });
                    }
                    Ok(_) => (
                        ErrorKind::EmptyOutput,
                        "encode produced zero bytes".to_string(),
                    ),
                    Err(err) => {
                        let kind = ErrorKind::from_driver_error(id, &err);
                        if kind.aborts_operation() {
                            warn!(source = source.id(), driver = %id, %kind, error = %err, "driver hit a resource ceiling");
                            return Err(TranscodingFailure::new(kind, err.to_string())
                                .with_driver(id)
                                .with_attempts(attempts)
                                .with_context("source", source.id())
                                .with_context("variant", &variant.name)
                                .with_context("format", current)
                                .with_context("width", dims.width)
                                .with_context("height", dims.height));
                        }
                        (kind, err.to_string())
                    }
                };

                debug!(driver = %id, format = %current, %kind, "encode attempt failed: {message}");
                attempts.push(AttemptRecord {
                    driver: id,
                    format: current,
                    kind,
                    message,
                });
                failed = Some((id, kind));
            }
            last_format = current;
        }

        Err(self.exhausted(source, variant, format, attempts))
    }

    fn exhausted(
        &self,
        source: &SourceImage,
        variant: &VariantSpec,
        format: Format,
        attempts: Vec<AttemptRecord>,
    ) -> TranscodingFailure {
        error!(
            source = source.id(),
            variant = %variant.name,
            %format,
            attempts = attempts.len(),
            "all drivers failed"
        );
        let mut drivers: Vec<DriverId> = Vec::new();
        for attempt in &attempts {
            if !drivers.contains(&attempt.driver) {
                drivers.push(attempt.driver);
            }
        }
        let mut failure = TranscodingFailure::new(
            ErrorKind::AllDriversFailed,
            format!(
                "{} attempt(s) failed for {} {format}",
                attempts.len(),
                variant.name
            ),
        )
        .with_context("source", source.id())
        .with_context("variant", &variant.name)
        .with_context("format", format);
        if let Some(&first) = drivers.first() {
            failure = failure.with_driver(first);
        }
        if let Some(&second) = drivers.get(1) {
            failure = failure.with_fallback_driver(second);
        }
        failure.with_attempts(attempts)
    }

    fn report(&self, event: FallbackEvent) {
        warn!(%event, "fallback");
        self.counter.on_fallback(&event);
        if let Some(observer) = &self.observer {
            observer.on_fallback(&event);
        }
    }
}
