//! Dimension analysis.
//!
//! [`DimensionAnalyzer::dimensions`] reads width and height from raw bytes,
//! cheaply when possible:
//!
//! 1. Header-only parse with the `image` crate's format sniffing
//!    (`ImageReader::into_dimensions`). No pixels are decoded.
//! 2. AVIF headers through `avif-parse`, since the `image` crate here only
//!    carries the AVIF encoder.
//! 3. Only if both fail: a full decode by the registry's primary driver,
//!    whose pixels are thrown away.
//!
//! The shape helpers live in [`imaging::calculations`](crate::imaging::calculations).

use crate::imaging::{Dimensions, DriverError, DriverId, Orientation, classify_orientation};
use crate::registry::{DriverRegistry, RegistryError};
use image::ImageReader;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Source is empty")]
    Empty,
    #[error("Source has zero-sized dimensions {0}")]
    Degenerate(Dimensions),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Full decode with {driver} failed: {source}")]
    Decode {
        driver: DriverId,
        #[source]
        source: DriverError,
    },
}

/// Width/height extraction with a header-only fast path.
#[derive(Clone)]
pub struct DimensionAnalyzer {
    registry: Arc<DriverRegistry>,
    square_tolerance: f64,
}

impl DimensionAnalyzer {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self {
            registry,
            square_tolerance: crate::imaging::calculations::DEFAULT_SQUARE_TOLERANCE,
        }
    }

    pub fn with_square_tolerance(mut self, tolerance: f64) -> Self {
        self.square_tolerance = tolerance;
        self
    }

    pub fn dimensions(&self, bytes: &[u8]) -> Result<Dimensions, AnalyzeError> {
        if bytes.is_empty() {
            return Err(AnalyzeError::Empty);
        }
        if let Some(dims) = header_dimensions(bytes) {
            return non_degenerate(dims);
        }

        let id = self.registry.primary()?;
        let driver = self
            .registry
            .driver(id)
            .ok_or(RegistryError::NotRegistered(id))?;
        debug!(driver = %id, bytes = bytes.len(), "header parse failed, falling back to full decode");
        let dims = driver
            .decode_dimensions(bytes)
            .map_err(|source| AnalyzeError::Decode { driver: id, source })?;
        non_degenerate(dims)
    }

    /// Orientation at the configured square tolerance.
    pub fn orientation(&self, dims: Dimensions) -> Option<Orientation> {
        classify_orientation(dims, self.square_tolerance)
    }
}

fn non_degenerate(dims: Dimensions) -> Result<Dimensions, AnalyzeError> {
    if dims.is_empty() {
        Err(AnalyzeError::Degenerate(dims))
    } else {
        Ok(dims)
    }
}

/// Dimensions from the file header alone, without decoding pixels.
pub fn header_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    if reader.format().is_some()
        && let Ok((width, height)) = reader.into_dimensions()
    {
        return Some(Dimensions::new(width, height));
    }
    avif_dimensions(bytes)
}

fn avif_dimensions(bytes: &[u8]) -> Option<Dimensions> {
    let avif = avif_parse::read_avif(&mut Cursor::new(bytes)).ok()?;
    let meta = avif.primary_item_metadata().ok()?;
    Some(Dimensions::new(
        meta.max_frame_width.get(),
        meta.max_frame_height.get(),
    ))
}
