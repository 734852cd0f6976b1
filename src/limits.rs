//! Resource limits and admission control.
//!
//! [`ResourceLimitGuard::check`] runs before a driver sees any pixels. It
//! rejects sources whose raw size, dimensions or estimated decoded size
//! would exceed the ceilings in force for that driver.
//!
//! ## Ceilings
//!
//! The ceiling for each of width, height, area and memory is resolved per
//! driver:
//!
//! 1. Start from the backend-agnostic value in `[limits]`.
//! 2. Apply the driver's override from `[limits.<driver>]`, if set.
//! 3. Combine with the driver's own live limit ([`Driver::live_limit`])
//!    according to [`LimitPrecedence`].
//!
//! | Precedence | Result |
//! |---|---|
//! | `tighter` (default) | the smaller of configured and live |
//! | `configured` | configured; live limits are never queried |
//! | `live` | live when the driver reports one, else configured |
//!
//! A failing live-limit query is logged and ignored. Only a confirmed
//! over-limit condition blocks a source.

use crate::analyzer::DimensionAnalyzer;
use crate::config::ConfigError;
use crate::error::{ErrorKind, TranscodingFailure};
use crate::imaging::{Dimensions, Driver, DriverId, LimitKind, estimated_decode_bytes};
use crate::source::SourceImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// How configured ceilings combine with a driver's live ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPrecedence {
    #[default]
    Tighter,
    Configured,
    Live,
}

/// Per-driver replacements for backend-agnostic ceilings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitOverrides {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub max_area: Option<u64>,
    pub max_memory_bytes: Option<u64>,
}

/// Safety envelope for source images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub max_width: u32,
    pub max_height: u32,
    /// Pixels.
    pub max_area: u64,
    /// Estimated decoded size, `width * height * 4`.
    pub max_memory_bytes: Option<u64>,
    /// Raw source size.
    pub max_source_bytes: Option<u64>,
    pub precedence: LimitPrecedence,
    pub imagick: LimitOverrides,
    pub native: LimitOverrides,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_width: 16384,
            max_height: 16384,
            max_area: 128_000_000,
            max_memory_bytes: Some(1024 * 1024 * 1024),
            max_source_bytes: Some(100 * 1024 * 1024),
            precedence: LimitPrecedence::Tighter,
            imagick: LimitOverrides::default(),
            native: LimitOverrides::default(),
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_width == 0 || self.max_height == 0 || self.max_area == 0 {
            return Err(ConfigError::Validation(
                "limits.max_width, max_height and max_area must be non-zero".into(),
            ));
        }
        if self.max_memory_bytes == Some(0) || self.max_source_bytes == Some(0) {
            return Err(ConfigError::Validation(
                "limits.max_memory_bytes and max_source_bytes must be non-zero when set".into(),
            ));
        }
        for id in DriverId::ALL {
            let o = self.overrides(id);
            if o.max_width == Some(0)
                || o.max_height == Some(0)
                || o.max_area == Some(0)
                || o.max_memory_bytes == Some(0)
            {
                return Err(ConfigError::Validation(format!(
                    "limits.{id} overrides must be non-zero when set"
                )));
            }
        }
        Ok(())
    }

    pub fn overrides(&self, id: DriverId) -> &LimitOverrides {
        match id {
            DriverId::Imagick => &self.imagick,
            DriverId::Native => &self.native,
        }
    }

    /// Configured ceilings for `id`, overrides applied, live limits ignored.
    pub fn configured_for(&self, id: DriverId) -> EffectiveLimits {
        let o = self.overrides(id);
        let pick = |base: u64, over: Option<u64>| match over {
            Some(value) => Ceiling::new(value, CeilingSource::Override),
            None => Ceiling::new(base, CeilingSource::Configured),
        };
        EffectiveLimits {
            width: pick(self.max_width as u64, o.max_width.map(u64::from)),
            height: pick(self.max_height as u64, o.max_height.map(u64::from)),
            area: pick(self.max_area, o.max_area),
            memory: match (o.max_memory_bytes, self.max_memory_bytes) {
                (Some(value), _) => Some(Ceiling::new(value, CeilingSource::Override)),
                (None, Some(value)) => Some(Ceiling::new(value, CeilingSource::Configured)),
                (None, None) => None,
            },
        }
    }
}

/// Where a ceiling came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeilingSource {
    Configured,
    Override,
    Live,
}

impl CeilingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CeilingSource::Configured => "configured",
            CeilingSource::Override => "override",
            CeilingSource::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ceiling {
    pub value: u64,
    pub source: CeilingSource,
}

impl Ceiling {
    pub fn new(value: u64, source: CeilingSource) -> Self {
        Self { value, source }
    }
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, self.source.as_str())
    }
}

/// Ceilings in force for one driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub width: Ceiling,
    pub height: Ceiling,
    pub area: Ceiling,
    pub memory: Option<Ceiling>,
}

fn combine(configured: Ceiling, live: Option<u64>, precedence: LimitPrecedence) -> Ceiling {
    match (precedence, live) {
        (LimitPrecedence::Live, Some(value)) => Ceiling::new(value, CeilingSource::Live),
        (LimitPrecedence::Tighter, Some(value)) if value < configured.value => {
            Ceiling::new(value, CeilingSource::Live)
        }
        _ => configured,
    }
}

fn combine_optional(
    configured: Option<Ceiling>,
    live: Option<u64>,
    precedence: LimitPrecedence,
) -> Option<Ceiling> {
    match configured {
        Some(ceiling) => Some(combine(ceiling, live, precedence)),
        None if precedence != LimitPrecedence::Configured => {
            live.map(|value| Ceiling::new(value, CeilingSource::Live))
        }
        None => None,
    }
}

/// Admission control.
#[derive(Clone)]
pub struct ResourceLimitGuard {
    analyzer: DimensionAnalyzer,
}

impl ResourceLimitGuard {
    pub fn new(analyzer: DimensionAnalyzer) -> Self {
        Self { analyzer }
    }

    pub fn analyzer(&self) -> &DimensionAnalyzer {
        &self.analyzer
    }

    /// Admit `source` for `driver`, returning its dimensions.
    ///
    /// Fails with `image_too_large`, `invalid_source`,
    /// `resource_limit_exceeded` or `memory_limit_exceeded`.
    pub fn check(
        &self,
        source: &SourceImage,
        driver: &dyn Driver,
        limits: &ResourceLimits,
    ) -> Result<Dimensions, TranscodingFailure> {
        let id = driver.id();
        if let Some(max) = limits.max_source_bytes {
            if source.byte_size() > max {
                return Err(TranscodingFailure::new(
                    ErrorKind::ImageTooLarge,
                    format!(
                        "source is {} bytes, limit is {max}",
                        source.byte_size()
                    ),
                )
                .with_driver(id)
                .with_context("source", source.id())
                .with_context("byte_size", source.byte_size())
                .with_context("max_source_bytes", max));
            }
        }

        let dims = source.dimensions_with(&self.analyzer).map_err(|e| {
            TranscodingFailure::new(
                ErrorKind::InvalidSource,
                format!("cannot determine dimensions: {e}"),
            )
            .with_driver(id)
            .with_context("source", source.id())
            .with_context("byte_size", source.byte_size())
        })?;

        self.check_dimensions(dims, driver, limits)
            .map_err(|f| f.with_context("source", source.id()))?;
        Ok(dims)
    }

    /// Compare known dimensions against the ceilings in force for `driver`.
    pub fn check_dimensions(
        &self,
        dims: Dimensions,
        driver: &dyn Driver,
        limits: &ResourceLimits,
    ) -> Result<(), TranscodingFailure> {
        let effective = self.effective_limits(driver, limits);
        let id = driver.id();
        debug!(driver = %id, dimensions = %dims, ?effective, "admission check");

        let over = [
            ("width", dims.width as u64, effective.width),
            ("height", dims.height as u64, effective.height),
            ("area", dims.area(), effective.area),
        ]
        .into_iter()
        .find(|(_, value, ceiling)| value > &ceiling.value);

        if let Some((limit, value, ceiling)) = over {
            return Err(TranscodingFailure::new(
                ErrorKind::ResourceLimitExceeded,
                format!("{dims} exceeds {limit} ceiling {ceiling}"),
            )
            .with_driver(id)
            .with_context("width", dims.width)
            .with_context("height", dims.height)
            .with_context("area", dims.area())
            .with_context("limit", limit)
            .with_context("value", value)
            .with_context("ceiling", ceiling.value)
            .with_context("ceiling_source", ceiling.source.as_str()));
        }

        if let Some(ceiling) = effective.memory {
            let estimated = estimated_decode_bytes(dims);
            if estimated > ceiling.value {
                return Err(TranscodingFailure::new(
                    ErrorKind::MemoryLimitExceeded,
                    format!("{dims} needs ~{estimated} bytes decoded, ceiling {ceiling}"),
                )
                .with_driver(id)
                .with_context("width", dims.width)
                .with_context("height", dims.height)
                .with_context("estimated_bytes", estimated)
                .with_context("ceiling", ceiling.value)
                .with_context("ceiling_source", ceiling.source.as_str()));
            }
        }
        Ok(())
    }

    /// Resolve the ceilings in force for `driver`.
    pub fn effective_limits(&self, driver: &dyn Driver, limits: &ResourceLimits) -> EffectiveLimits {
        let configured = limits.configured_for(driver.id());
        let precedence = limits.precedence;
        if precedence == LimitPrecedence::Configured {
            return configured;
        }
        EffectiveLimits {
            width: combine(configured.width, live_limit(driver, LimitKind::Width), precedence),
            height: combine(configured.height, live_limit(driver, LimitKind::Height), precedence),
            area: combine(configured.area, live_limit(driver, LimitKind::Area), precedence),
            memory: combine_optional(
                configured.memory,
                live_limit(driver, LimitKind::Memory),
                precedence,
            ),
        }
    }
}

/// Query one live ceiling; a failed query counts as "no live ceiling".
fn live_limit(driver: &dyn Driver, kind: LimitKind) -> Option<u64> {
    match driver.live_limit(kind) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                driver = %driver.id(),
                limit = kind.as_str(),
                error = %e,
                "limit probe failed, using configured ceiling"
            );
            None
        }
    }
}
