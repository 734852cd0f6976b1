//! Pure Rust codec driver with no system dependencies.
//!
//! Everything is statically linked into the binary, so this driver is always
//! available and is the usual last entry of the priority list.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, BMP, TIFF, WebP) | `image` crate (pure Rust decoders) |
//! | Resize | `image::imageops::resize` with `Lanczos3` filter |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` with quality |
//! | Encode → WebP / PNG / GIF / BMP / TIFF | `DynamicImage::write_to` (WebP is lossless) |
//!
//! AVIF *input* is not decodable here: the `image` crate's `"avif"` feature
//! only enables the encoder. AVIF sources still get dimensions from the
//! header-only path in [`analyzer`](crate::analyzer); full decodes fall
//! through to another driver.

use super::calculations::Dimensions;
use super::driver::{Driver, DriverError, DriverId, LimitKind};
use super::format::Format;
use super::params::{EncodeRequest, Quality};
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageReader};
use std::io::Cursor;

/// rav1e speed preset: 6 trades a little size for reasonable throughput.
const AVIF_SPEED: u8 = 6;

/// Pure Rust driver using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
#[derive(Debug, Clone, Default)]
pub struct NativeDriver {
    /// Decoder allocation ceiling in bytes, if any.
    max_alloc: Option<u64>,
}

impl NativeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap decoder allocations. Sources needing more fail with
    /// [`DriverError::ResourceExhausted`] before pixels are allocated.
    pub fn with_max_alloc(max_alloc: u64) -> Self {
        Self {
            max_alloc: Some(max_alloc),
        }
    }

    fn decoder_limits(&self) -> image::Limits {
        let mut limits = image::Limits::default();
        limits.max_alloc = self.max_alloc;
        limits
    }

    /// Decode `source` with this driver's allocation limits applied.
    fn load(&self, source: &[u8]) -> Result<DynamicImage, DriverError> {
        let mut reader = ImageReader::new(Cursor::new(source))
            .with_guessed_format()
            .map_err(DriverError::Io)?;
        reader.limits(self.decoder_limits());
        reader.decode().map_err(|e| match e {
            ImageError::Limits(limit) => DriverError::ResourceExhausted(limit.to_string()),
            other => DriverError::DecodeFailed(other.to_string()),
        })
    }
}

/// Encode a decoded image into `format`.
fn encode_image(img: &DynamicImage, format: Format, quality: Quality) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    let q = quality.value() as u8;

    let result = match format {
        Format::Jpeg => {
            // JPEG has no alpha channel
            let rgb = img.to_rgb8();
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, q);
            rgb.write_with_encoder(encoder)
        }
        Format::Avif => {
            let rgba = img.to_rgba8();
            let encoder =
                image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut buf, AVIF_SPEED, q);
            rgba.write_with_encoder(encoder)
        }
        Format::Webp | Format::Png | Format::Gif | Format::Bmp | Format::Tiff => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut buf), format.image_format())
        }
    };

    result.map_err(|e| match e {
        ImageError::Unsupported(_) => DriverError::UnsupportedFormat(format),
        ImageError::Limits(limit) => DriverError::ResourceExhausted(limit.to_string()),
        other => DriverError::EncodeFailed(format!("{format} encode failed: {other}")),
    })?;
    Ok(buf)
}

impl Driver for NativeDriver {
    fn id(&self) -> DriverId {
        DriverId::Native
    }

    fn probe(&self) -> bool {
        true
    }

    fn decode_dimensions(&self, source: &[u8]) -> Result<Dimensions, DriverError> {
        let img = self.load(source)?;
        Ok(Dimensions::new(img.width(), img.height()))
    }

    fn encode(&self, source: &[u8], request: &EncodeRequest) -> Result<Vec<u8>, DriverError> {
        let img = self.load(source)?;
        let target = request.target;
        let resized = if img.width() == target.width && img.height() == target.height {
            img
        } else {
            img.resize_exact(target.width, target.height, FilterType::Lanczos3)
        };
        encode_image(&resized, request.format, request.quality)
    }

    fn live_limit(&self, kind: LimitKind) -> Result<Option<u64>, DriverError> {
        Ok(match kind {
            LimitKind::Memory => self.max_alloc,
            _ => None,
        })
    }
}
