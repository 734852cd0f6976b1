//! Driver trait and shared types.
//!
//! A [`Driver`] is one interchangeable codec backend. The set of backends is
//! closed: every driver has a [`DriverId`], and the registry builds them from
//! an explicit constructor table keyed by that id.
//!
//! | Driver | Implementation | Live limits |
//! |---|---|---|
//! | `imagick` | [`ImagickDriver`](super::magick::ImagickDriver): ImageMagick CLI | yes (`-list resource`) |
//! | `native` | [`NativeDriver`](super::native::NativeDriver): `image` crate, statically linked | no |
//!
//! Drivers never decide *whether* to run; admission control and fallback
//! live in the orchestrator. A driver only reports what happened through a
//! [`DriverError`], and the orchestrator branches on it.

use super::calculations::Dimensions;
use super::params::EncodeRequest;
use crate::imaging::Format;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Identifier of a codec backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverId {
    /// ImageMagick, driven through its command-line interface.
    Imagick,
    /// Pure-Rust codecs from the `image` crate.
    Native,
}

impl DriverId {
    pub const ALL: [DriverId; 2] = [DriverId::Imagick, DriverId::Native];

    pub fn as_str(self) -> &'static str {
        match self {
            DriverId::Imagick => "imagick",
            DriverId::Native => "native",
        }
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imagick" => Ok(DriverId::Imagick),
            "native" => Ok(DriverId::Native),
            other => Err(format!("unknown driver: {other}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Driver not available: {0}")]
    NotAvailable(String),
    #[error("Cannot encode {0}")]
    UnsupportedFormat(Format),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Encode failed: {0}")]
    EncodeFailed(String),
    #[error("Driver resource limit reached: {0}")]
    ResourceExhausted(String),
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Limit introspection failed: {0}")]
    Introspection(String),
}

/// A resource ceiling a driver may enforce internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Width,
    Height,
    /// Pixels.
    Area,
    /// Bytes of pixel cache.
    Memory,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitKind::Width => "width",
            LimitKind::Height => "height",
            LimitKind::Area => "area",
            LimitKind::Memory => "memory",
        }
    }
}

/// Trait for codec backends.
///
/// Implementations must be `Send + Sync`: one registry is shared by every
/// worker thread materializing variants.
pub trait Driver: Send + Sync {
    fn id(&self) -> DriverId;

    /// Whether the backend is usable on this host. Called once per registry.
    fn probe(&self) -> bool;

    /// Full decode, used only when a header-only parse failed.
    fn decode_dimensions(&self, source: &[u8]) -> Result<Dimensions, DriverError>;

    /// Resize `source` to `request.target` and encode it as `request.format`.
    fn encode(&self, source: &[u8], request: &EncodeRequest) -> Result<Vec<u8>, DriverError>;

    /// The backend's own ceiling for `kind`, if it exposes one.
    ///
    /// `Ok(None)` means the backend has no such limit.
    fn live_limit(&self, _kind: LimitKind) -> Result<Option<u64>, DriverError> {
        Ok(None)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted result of a mock encode.
    #[derive(Debug, Clone, PartialEq)]
    pub enum MockOutcome {
        /// Return a small non-empty payload naming the driver and format.
        Succeed,
        /// Return zero bytes.
        Empty,
        EncodeError(String),
        Unsupported,
        NotAvailable,
        Exhausted(String),
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedOp {
        Probe,
        DecodeDimensions,
        Encode {
            format: Format,
            width: u32,
            height: u32,
            quality: u32,
        },
        LiveLimit(LimitKind),
    }

    /// Mock driver that records operations and returns scripted outcomes.
    /// Uses Mutex (not RefCell) so it is Sync and works with rayon's par_iter.
    pub struct MockDriver {
        pub id: DriverId,
        pub available: bool,
        pub dimensions: Option<Dimensions>,
        pub default_outcome: MockOutcome,
        pub outcomes: HashMap<Format, MockOutcome>,
        pub live_limits: HashMap<LimitKind, Result<u64, String>>,
        pub operations: Mutex<Vec<RecordedOp>>,
    }

    impl MockDriver {
        pub fn new(id: DriverId) -> Self {
            Self {
                id,
                available: true,
                dimensions: None,
                default_outcome: MockOutcome::Succeed,
                outcomes: HashMap::new(),
                live_limits: HashMap::new(),
                operations: Mutex::new(Vec::new()),
            }
        }

        pub fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }

        pub fn with_dimensions(mut self, dims: Dimensions) -> Self {
            self.dimensions = Some(dims);
            self
        }

        pub fn with_default(mut self, outcome: MockOutcome) -> Self {
            self.default_outcome = outcome;
            self
        }

        pub fn with_outcome(mut self, format: Format, outcome: MockOutcome) -> Self {
            self.outcomes.insert(format, outcome);
            self
        }

        pub fn with_live_limit(mut self, kind: LimitKind, value: u64) -> Self {
            self.live_limits.insert(kind, Ok(value));
            self
        }

        pub fn with_broken_live_limit(mut self, kind: LimitKind) -> Self {
            self.live_limits
                .insert(kind, Err("limit introspection failed".to_string()));
            self
        }

        pub fn get_operations(&self) -> Vec<RecordedOp> {
            self.operations.lock().unwrap().clone()
        }

        pub fn encode_calls(&self) -> Vec<RecordedOp> {
            self.get_operations()
                .into_iter()
                .filter(|op| matches!(op, RecordedOp::Encode { .. }))
                .collect()
        }

        fn record(&self, op: RecordedOp) {
            self.operations.lock().unwrap().push(op);
        }
    }

    impl Driver for MockDriver {
        fn id(&self) -> DriverId {
            self.id
        }

        fn probe(&self) -> bool {
            self.record(RecordedOp::Probe);
            self.available
        }

        fn decode_dimensions(&self, _source: &[u8]) -> Result<Dimensions, DriverError> {
            self.record(RecordedOp::DecodeDimensions);
            self.dimensions
                .ok_or_else(|| DriverError::DecodeFailed("No mock dimensions".to_string()))
        }

        fn encode(&self, _source: &[u8], request: &EncodeRequest) -> Result<Vec<u8>, DriverError> {
            self.record(RecordedOp::Encode {
                format: request.format,
                width: request.target.width,
                height: request.target.height,
                quality: request.quality.value(),
            });

            let outcome = self
                .outcomes
                .get(&request.format)
                .unwrap_or(&self.default_outcome);
            match outcome {
                MockOutcome::Succeed => {
                    Ok(format!("{}:{}:{}", self.id, request.format, request.target).into_bytes())
                }
                MockOutcome::Empty => Ok(Vec::new()),
                MockOutcome::EncodeError(msg) => Err(DriverError::EncodeFailed(msg.clone())),
                MockOutcome::Unsupported => Err(DriverError::UnsupportedFormat(request.format)),
                MockOutcome::NotAvailable => {
                    Err(DriverError::NotAvailable(format!("{} missing", self.id)))
                }
                MockOutcome::Exhausted(msg) => Err(DriverError::ResourceExhausted(msg.clone())),
            }
        }

        fn live_limit(&self, kind: LimitKind) -> Result<Option<u64>, DriverError> {
            self.record(RecordedOp::LiveLimit(kind));
            match self.live_limits.get(&kind) {
                Some(Ok(v)) => Ok(Some(*v)),
                Some(Err(msg)) => Err(DriverError::Introspection(msg.clone())),
                None => Ok(None),
            }
        }
    }

    #[test]
    fn mock_records_encode() {
        use crate::imaging::Quality;

        let driver = MockDriver::new(DriverId::Native);
        let req = EncodeRequest::new(Format::Webp, Dimensions::new(800, 600), Quality::new(90));
        let bytes = driver.encode(b"src", &req).unwrap();
        assert_eq!(bytes, b"native:webp:800x600");

        let ops = driver.get_operations();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            &ops[0],
            RecordedOp::Encode {
                format: Format::Webp,
                width: 800,
                height: 600,
                quality: 90,
            }
        ));
    }

    #[test]
    fn mock_scripted_failure_per_format() {
        use crate::imaging::Quality;

        let driver = MockDriver::new(DriverId::Imagick)
            .with_outcome(Format::Avif, MockOutcome::Unsupported);
        let req = EncodeRequest::new(Format::Avif, Dimensions::new(10, 10), Quality::default());
        assert!(matches!(
            driver.encode(b"src", &req),
            Err(DriverError::UnsupportedFormat(Format::Avif))
        ));
        let jpeg = EncodeRequest::new(Format::Jpeg, req.target, req.quality);
        assert!(driver.encode(b"src", &jpeg).is_ok());
    }

    #[test]
    fn mock_decode_without_dimensions_errors() {
        let driver = MockDriver::new(DriverId::Native);
        assert!(driver.decode_dimensions(b"src").is_err());
    }

    #[test]
    fn driver_id_round_trips_through_str() {
        for id in DriverId::ALL {
            assert_eq!(id.as_str().parse::<DriverId>().unwrap(), id);
        }
        assert!("gd".parse::<DriverId>().is_err());
    }
}
