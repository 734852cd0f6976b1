//! Fallback notifications.
//!
//! Frequent fallback means the primary driver is unhealthy, so every
//! fallback the orchestrator takes is reported to a [`FallbackObserver`]
//! in addition to the `warn!` log line. Every transcoder counts them in a
//! [`FallbackCounter`]; callers plug in their own observer to feed metrics
//! or alerting.

use crate::error::ErrorKind;
use crate::imaging::{DriverId, Format};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackEvent {
    /// `from` failed with `kind`; `to` is tried next for the same format.
    Driver {
        from: DriverId,
        to: DriverId,
        format: Format,
        kind: ErrorKind,
    },
    /// No driver produced `from`; the orchestrator moved on to `to`.
    Format { from: Format, to: Format },
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::Driver {
                from,
                to,
                format,
                kind,
            } => write!(f, "driver {from} -> {to} for {format} ({kind})"),
            FallbackEvent::Format { from, to } => write!(f, "format {from} -> {to}"),
        }
    }
}

pub trait FallbackObserver: Send + Sync {
    fn on_fallback(&self, event: &FallbackEvent);
}

/// Counts fallbacks by kind.
#[derive(Debug, Default)]
pub struct FallbackCounter {
    driver: AtomicU64,
    format: AtomicU64,
}

impl FallbackCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driver_fallbacks(&self) -> u64 {
        self.driver.load(Ordering::Relaxed)
    }

    pub fn format_fallbacks(&self) -> u64 {
        self.format.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.driver_fallbacks() + self.format_fallbacks()
    }
}

impl FallbackObserver for FallbackCounter {
    fn on_fallback(&self, event: &FallbackEvent) {
        let counter = match event {
            FallbackEvent::Driver { .. } => &self.driver,
            FallbackEvent::Format { .. } => &self.format,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_splits_by_kind() {
        let counter = FallbackCounter::new();
        counter.on_fallback(&FallbackEvent::Driver {
            from: DriverId::Imagick,
            to: DriverId::Native,
            format: Format::Webp,
            kind: ErrorKind::ImagickEncodingFailed,
        });
        counter.on_fallback(&FallbackEvent::Format {
            from: Format::Avif,
            to: Format::Webp,
        });
        counter.on_fallback(&FallbackEvent::Format {
            from: Format::Webp,
            to: Format::Jpeg,
        });

        assert_eq!(counter.driver_fallbacks(), 1);
        assert_eq!(counter.format_fallbacks(), 2);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn event_display() {
        let event = FallbackEvent::Driver {
            from: DriverId::Imagick,
            to: DriverId::Native,
            format: Format::Avif,
            kind: ErrorKind::EmptyOutput,
        };
        assert_eq!(
            event.to_string(),
            "driver imagick -> native for avif (empty_output)"
        );
        assert_eq!(
            FallbackEvent::Format {
                from: Format::Avif,
                to: Format::Jpeg
            }
            .to_string(),
            "format avif -> jpeg"
        );
    }
}
