//! Parameter types for encode operations.
//!
//! These structs describe *what* to produce, not *how*. They are the
//! interface between the [`orchestrator`](crate::orchestrator) (which decides
//! the target size and format) and a [`Driver`](super::driver::Driver)
//! (which does the pixel work). Keeping them plain data lets tests swap in a
//! mock driver without changing orchestration logic.
//!
//! ## Types
//!
//! - [`Quality`]: lossy encoding quality (1–100, default 82). Clamped on construction.
//! - [`EncodeRequest`]: target format, bounding dimensions and quality for one encode.

use super::calculations::Dimensions;
use super::format::Format;
use serde::{Deserialize, Serialize};

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(82)
    }
}

/// Everything a driver needs to produce one output.
///
/// `target` is the final size already computed with
/// [`fit_within`](super::calculations::fit_within); drivers resize to it
/// exactly and never crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeRequest {
    pub format: Format,
    pub target: Dimensions,
    pub quality: Quality,
}

impl EncodeRequest {
    pub fn new(format: Format, target: Dimensions, quality: Quality) -> Self {
        Self {
            format,
            target,
            quality,
        }
    }
}
