//! Structured transcoding failures.
//!
//! Every failure the orchestrator surfaces is a [`TranscodingFailure`]: a
//! value, not a panic or a raw driver error. Callers branch on
//! [`ErrorKind`], whose [`as_str`](ErrorKind::as_str) tag is stable and safe
//! to use as a metrics label or a persisted job status.
//!
//! | Kind | Fallback-eligible | Default severity |
//! |---|---|---|
//! | `imagick_encoding_failed` | yes | warning |
//! | `gd_encoding_failed` | no | info |
//! | `driver_not_available` | yes | error |
//! | `empty_output` | yes | info |
//! | `resource_limit_exceeded` | no, aborts the operation | critical |
//! | `unsupported_format` | yes | warning |
//! | `invalid_source` | no, aborts the operation | error |
//! | `all_drivers_failed` | no, terminal | error |
//! | `memory_limit_exceeded` | no, aborts the operation | critical |
//! | `image_too_large` | no, aborts the operation | critical |
//!
//! Fallback eligibility describes the kind itself. The orchestrator still
//! moves on to the next candidate after any per-driver encode failure; only
//! the resource-class kinds ([`ErrorKind::aborts_operation`]) stop it.

use crate::imaging::{DriverError, DriverId, Format};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Stable failure tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ImagickEncodingFailed,
    /// Encode error from the native driver, which fills the alternate-backend
    /// slot of the taxonomy.
    GdEncodingFailed,
    DriverNotAvailable,
    EmptyOutput,
    ResourceLimitExceeded,
    UnsupportedFormat,
    InvalidSource,
    AllDriversFailed,
    MemoryLimitExceeded,
    ImageTooLarge,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::ImagickEncodingFailed,
        ErrorKind::GdEncodingFailed,
        ErrorKind::DriverNotAvailable,
        ErrorKind::EmptyOutput,
        ErrorKind::ResourceLimitExceeded,
        ErrorKind::UnsupportedFormat,
        ErrorKind::InvalidSource,
        ErrorKind::AllDriversFailed,
        ErrorKind::MemoryLimitExceeded,
        ErrorKind::ImageTooLarge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ImagickEncodingFailed => "imagick_encoding_failed",
            ErrorKind::GdEncodingFailed => "gd_encoding_failed",
            ErrorKind::DriverNotAvailable => "driver_not_available",
            ErrorKind::EmptyOutput => "empty_output",
            ErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::InvalidSource => "invalid_source",
            ErrorKind::AllDriversFailed => "all_drivers_failed",
            ErrorKind::MemoryLimitExceeded => "memory_limit_exceeded",
            ErrorKind::ImageTooLarge => "image_too_large",
        }
    }

    pub fn default_severity(self) -> Severity {
        match self {
            ErrorKind::ImagickEncodingFailed | ErrorKind::UnsupportedFormat => Severity::Warning,
            ErrorKind::GdEncodingFailed | ErrorKind::EmptyOutput => Severity::Info,
            ErrorKind::DriverNotAvailable
            | ErrorKind::InvalidSource
            | ErrorKind::AllDriversFailed => Severity::Error,
            ErrorKind::ResourceLimitExceeded
            | ErrorKind::MemoryLimitExceeded
            | ErrorKind::ImageTooLarge => Severity::Critical,
        }
    }

    /// Whether a different driver or format may succeed where this failed.
    pub fn fallback_eligible(self) -> bool {
        matches!(
            self,
            ErrorKind::ImagickEncodingFailed
                | ErrorKind::DriverNotAvailable
                | ErrorKind::EmptyOutput
                | ErrorKind::UnsupportedFormat
        )
    }

    /// Input-class failures: no driver can do better, so the whole call stops.
    pub fn aborts_operation(self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceLimitExceeded
                | ErrorKind::MemoryLimitExceeded
                | ErrorKind::ImageTooLarge
                | ErrorKind::InvalidSource
        )
    }

    /// Recommended caller policy for re-queueing a failed job.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::DriverNotAvailable | ErrorKind::EmptyOutput)
    }

    /// Kind reported when `driver`'s encode call raised.
    pub fn encoding_failed(driver: DriverId) -> Self {
        match driver {
            DriverId::Imagick => ErrorKind::ImagickEncodingFailed,
            DriverId::Native => ErrorKind::GdEncodingFailed,
        }
    }

    /// Classify an error returned by `driver`'s encode path.
    pub fn from_driver_error(driver: DriverId, err: &DriverError) -> Self {
        match err {
            DriverError::NotAvailable(_) => ErrorKind::DriverNotAvailable,
            DriverError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            DriverError::ResourceExhausted(_) => ErrorKind::MemoryLimitExceeded,
            DriverError::Io(_)
            | DriverError::DecodeFailed(_)
            | DriverError::EncodeFailed(_)
            | DriverError::TimedOut(_)
            | DriverError::Introspection(_) => ErrorKind::encoding_failed(driver),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed encode inside a transcode call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub driver: DriverId,
    pub format: Format,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} ({})",
            self.driver, self.format, self.kind, self.message
        )
    }
}

/// A structured failure value.
///
/// Built with [`TranscodingFailure::new`] and the `with_*` methods; the
/// severity starts at the kind's default.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind}: {description}")]
pub struct TranscodingFailure {
    kind: ErrorKind,
    description: String,
    severity: Severity,
    driver: Option<DriverId>,
    fallback_driver: Option<DriverId>,
    fallback_attempted: bool,
    attempts: Vec<AttemptRecord>,
    context: BTreeMap<String, String>,
}

impl TranscodingFailure {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            severity: kind.default_severity(),
            driver: None,
            fallback_driver: None,
            fallback_attempted: false,
            attempts: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_driver(mut self, driver: DriverId) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_fallback_driver(mut self, driver: DriverId) -> Self {
        self.fallback_driver = Some(driver);
        self.fallback_attempted = true;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Attach the per-driver attempts, also listing them in the context map
    /// as `attempt.NN` entries, zero-padded so they sort in attempt order.
    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        for (i, attempt) in attempts.iter().enumerate() {
            self.context
                .insert(format!("attempt.{:02}", i + 1), attempt.to_string());
        }
        if attempts.len() > 1 {
            self.fallback_attempted = true;
        }
        self.attempts = attempts;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// The driver the failure is attributed to.
    pub fn driver(&self) -> Option<DriverId> {
        self.driver
    }

    /// The driver tried after [`driver`](Self::driver), if any.
    pub fn fallback_driver(&self) -> Option<DriverId> {
        self.fallback_driver
    }

    /// Whether a fallback should be attempted for this kind.
    pub fn fallback_eligible(&self) -> bool {
        self.kind.fallback_eligible()
    }

    /// Whether a driver or format fallback was actually attempted.
    pub fn fallback_attempted(&self) -> bool {
        self.fallback_attempted
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }
}
