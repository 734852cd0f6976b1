//! CLI output formatting.
//!
//! Each command has a `format_*` function returning `Vec<String>` for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects. Logs go to stderr through
//! `tracing`, so stdout stays clean for piping.
//!
//! # Output Format
//!
//! ## Drivers
//!
//! ```text
//! 001 imagick (available)
//!     Formats: webp, avif, jpeg, png
//! 002 native (missing)
//!     Formats: jpeg, png, webp
//! ```
//!
//! ## Materialize
//!
//! ```text
//! dawn: 3 created, 1 present, 0 failed
//!     thumbnail webp → dawn/thumbnail.webp (150x113, imagick)
//!     thumbnail avif: all_drivers_failed: 2 attempt(s) failed for thumbnail avif
//! Fallbacks: 2 driver, 1 format
//! ```

use crate::catalog::{MaterializeReport, OptimizedVariant};
use crate::error::TranscodingFailure;
use crate::events::FallbackCounter;
use crate::imaging::{Dimensions, DriverId, Orientation};
use crate::orchestrator::EncodedImage;
use crate::registry::DriverDescriptor;
use crate::source::SourceImage;
use std::path::Path;

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn orientation_label(orientation: Orientation) -> &'static str {
    match orientation {
        Orientation::Landscape => "landscape",
        Orientation::Portrait => "portrait",
        Orientation::Square => "square",
    }
}

// ============================================================================
// Drivers
// ============================================================================

pub fn format_drivers(descriptors: &[DriverDescriptor]) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, d) in descriptors.iter().enumerate() {
        let status = if d.available { "available" } else { "missing" };
        lines.push(format!("{} {} ({})", format_index(i + 1), d.id, status));
        lines.push(format!("    Formats: {}", join_display(&d.formats)));
    }
    if !descriptors.iter().any(|d| d.available) {
        lines.push("No driver available".to_string());
    }
    lines
}

pub fn print_drivers(descriptors: &[DriverDescriptor]) {
    for line in format_drivers(descriptors) {
        println!("{}", line);
    }
}

// ============================================================================
// Probe
// ============================================================================

/// Admission verdict of one driver for a probed source.
pub type Admission = (DriverId, Result<(), TranscodingFailure>);

/// Dimensions, orientation and per-driver admission of one source.
///
/// ```text
/// dawn (2481033 bytes)
///     Checksum: 3f2a…
///     Dimensions: 4000x3000 (landscape)
///     imagick: admitted
///     native: resource_limit_exceeded: width 20000 exceeds 16384
/// ```
pub fn format_probe(
    source: &SourceImage,
    dimensions: Result<Dimensions, String>,
    orientation: Option<Orientation>,
    admissions: &[Admission],
) -> Vec<String> {
    let mut lines = vec![
        format!("{} ({} bytes)", source.id(), source.byte_size()),
        format!("    Checksum: {}", source.checksum()),
    ];
    match dimensions {
        Ok(dims) => match orientation {
            Some(o) => lines.push(format!("    Dimensions: {} ({})", dims, orientation_label(o))),
            None => lines.push(format!("    Dimensions: {}", dims)),
        },
        Err(e) => lines.push(format!("    Dimensions: unreadable ({})", e)),
    }
    for (id, verdict) in admissions {
        match verdict {
            Ok(()) => lines.push(format!("    {}: admitted", id)),
            Err(failure) => lines.push(format!("    {}: {}", id, failure)),
        }
    }
    lines
}

pub fn print_probe(
    source: &SourceImage,
    dimensions: Result<Dimensions, String>,
    orientation: Option<Orientation>,
    admissions: &[Admission],
) {
    for line in format_probe(source, dimensions, orientation, admissions) {
        println!("{}", line);
    }
}

// ============================================================================
// Transcode
// ============================================================================

pub fn format_transcode(image: &EncodedImage, written: &Path) -> Vec<String> {
    let mut lines = vec![format!(
        "{} → {} ({}x{}, {} bytes, {})",
        image.format,
        written.display(),
        image.width,
        image.height,
        image.bytes.len(),
        image.driver
    )];
    if image.format != image.requested_format {
        lines.push(format!(
            "    Requested {}, fell back to {}",
            image.requested_format, image.format
        ));
    } else if image.fallback_used {
        lines.push("    Produced after driver fallback".to_string());
    }
    lines
}

pub fn print_transcode(image: &EncodedImage, written: &Path) {
    for line in format_transcode(image, written) {
        println!("{}", line);
    }
}

/// A failure with its context and every recorded attempt.
pub fn format_failure(failure: &TranscodingFailure) -> Vec<String> {
    let mut lines = vec![format!("{} [{}]", failure, failure.severity().as_str())];
    for (key, value) in failure.context() {
        if key.starts_with("attempt.") {
            continue;
        }
        lines.push(format!("    {}: {}", key, value));
    }
    for (i, attempt) in failure.attempts().iter().enumerate() {
        lines.push(format!("    {} {}", format_index(i + 1), attempt));
    }
    lines
}

// ============================================================================
// Materialize
// ============================================================================

fn variant_line(row: &OptimizedVariant) -> String {
    format!(
        "    {} {} → {} ({}x{}, {})",
        row.variant, row.format, row.path, row.width, row.height, row.driver
    )
}

pub fn format_materialize_report(report: &MaterializeReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{}: {} created, {} present, {} failed",
        report.source_id,
        report.created.len(),
        report.skipped,
        report.failures.len()
    )];
    lines.extend(report.created.iter().map(variant_line));
    for failure in &report.failures {
        lines.push(format!(
            "    {} {}: {}",
            failure.variant, failure.format, failure.error
        ));
    }
    lines
}

pub fn print_materialize_report(report: &MaterializeReport) {
    for line in format_materialize_report(report) {
        println!("{}", line);
    }
}

/// One line summarizing fallbacks, or nothing when none were taken.
pub fn format_fallback_summary(counter: &FallbackCounter) -> Option<String> {
    (counter.total() > 0).then(|| {
        format!(
            "Fallbacks: {} driver, {} format",
            counter.driver_fallbacks(),
            counter.format_fallbacks()
        )
    })
}

pub fn print_fallback_summary(counter: &FallbackCounter) {
    if let Some(line) = format_fallback_summary(counter) {
        println!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MaterializeError, PairFailure};
    use crate::error::{AttemptRecord, ErrorKind};
    use crate::events::{FallbackEvent, FallbackObserver};
    use crate::imaging::Format;

    fn row(variant: &str, format: Format) -> OptimizedVariant {
        OptimizedVariant {
            source_id: "dawn".into(),
            variant: variant.into(),
            format,
            path: format!("dawn/{variant}.{}", format.extension()),
            byte_size: 100,
            width: 150,
            height: 113,
            driver: DriverId::Imagick,
        }
    }

    #[test]
    fn format_index_pads() {
        assert_eq!(format_index(1), "001");
        assert_eq!(format_index(100), "100");
    }

    #[test]
    fn drivers_listing() {
        let lines = format_drivers(&[
            DriverDescriptor {
                id: DriverId::Imagick,
                formats: vec![Format::Webp, Format::Avif],
                available: true,
            },
            DriverDescriptor {
                id: DriverId::Native,
                formats: vec![Format::Jpeg],
                available: false,
            },
        ]);
        assert_eq!(
            lines,
            vec![
                "001 imagick (available)",
                "    Formats: webp, avif",
                "002 native (missing)",
                "    Formats: jpeg",
            ]
        );
    }

    #[test]
    fn drivers_listing_flags_none_available() {
        let lines = format_drivers(&[DriverDescriptor {
            id: DriverId::Native,
            formats: vec![Format::Jpeg],
            available: false,
        }]);
        assert_eq!(lines.last().unwrap(), "No driver available");
    }

    #[test]
    fn probe_lists_admissions() {
        let source = SourceImage::new("dawn", b"abc".to_vec());
        let rejected = TranscodingFailure::new(ErrorKind::ResourceLimitExceeded, "too wide");
        let lines = format_probe(
            &source,
            Ok(Dimensions::new(4000, 3000)),
            Some(Orientation::Landscape),
            &[(DriverId::Imagick, Ok(())), (DriverId::Native, Err(rejected))],
        );
        assert_eq!(lines[0], "dawn (3 bytes)");
        assert_eq!(lines[2], "    Dimensions: 4000x3000 (landscape)");
        assert_eq!(lines[3], "    imagick: admitted");
        assert_eq!(lines[4], "    native: resource_limit_exceeded: too wide");
    }

    #[test]
    fn probe_unreadable_dimensions() {
        let source = SourceImage::new("junk", b"x".to_vec());
        let lines = format_probe(&source, Err("no decoder".into()), None, &[]);
        assert_eq!(lines[2], "    Dimensions: unreadable (no decoder)");
    }

    #[test]
    fn transcode_reports_format_fallback() {
        let image = EncodedImage {
            bytes: vec![1, 2, 3],
            format: Format::Jpeg,
            requested_format: Format::Avif,
            driver: DriverId::Native,
            width: 800,
            height: 600,
            fallback_used: true,
        };
        let lines = format_transcode(&image, Path::new("out.jpg"));
        assert_eq!(lines[0], "jpeg → out.jpg (800x600, 3 bytes, native)");
        assert_eq!(lines[1], "    Requested avif, fell back to jpeg");
    }

    #[test]
    fn failure_lists_attempts_once() {
        let failure = TranscodingFailure::new(ErrorKind::AllDriversFailed, "2 attempt(s) failed")
            .with_context("source", "dawn")
            .with_attempts(vec![
                AttemptRecord {
                    driver: DriverId::Imagick,
                    format: Format::Webp,
                    kind: ErrorKind::ImagickEncodingFailed,
                    message: "boom".into(),
                },
                AttemptRecord {
                    driver: DriverId::Native,
                    format: Format::Webp,
                    kind: ErrorKind::EmptyOutput,
                    message: "encode produced zero bytes".into(),
                },
            ]);
        let lines = format_failure(&failure);
        assert!(lines[0].starts_with("all_drivers_failed: 2 attempt(s) failed"));
        assert!(lines.contains(&"    source: dawn".to_string()));
        assert_eq!(lines.iter().filter(|l| l.contains("imagick/webp")).count(), 1);
        assert!(!lines.iter().any(|l| l.contains("attempt.")));
    }

    #[test]
    fn materialize_summary() {
        let report = MaterializeReport {
            source_id: "dawn".into(),
            created: vec![row("thumbnail", Format::Webp)],
            skipped: 2,
            failures: vec![PairFailure {
                variant: "thumbnail".into(),
                format: Format::Avif,
                error: MaterializeError::Transcode(TranscodingFailure::new(
                    ErrorKind::AllDriversFailed,
                    "nothing worked",
                )),
            }],
        };
        let lines = format_materialize_report(&report);
        assert_eq!(
            lines,
            vec![
                "dawn: 1 created, 2 present, 1 failed",
                "    thumbnail webp → dawn/thumbnail.webp (150x113, imagick)",
                "    thumbnail avif: all_drivers_failed: nothing worked",
            ]
        );
    }

    #[test]
    fn fallback_summary_only_when_fallbacks_happened() {
        let counter = FallbackCounter::new();
        assert_eq!(format_fallback_summary(&counter), None);

        counter.on_fallback(&FallbackEvent::Format {
            from: Format::Avif,
            to: Format::Webp,
        });
        assert_eq!(
            format_fallback_summary(&counter).as_deref(),
            Some("Fallbacks: 0 driver, 1 format")
        );
    }
}
