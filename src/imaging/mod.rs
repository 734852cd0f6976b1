//! Codec backends and the pure math around them.
//!
//! | Operation | Where |
//! |---|---|
//! | **Dimension math** | [`calculations`]: `fit_within`, `scale_to_fit`, orientation |
//! | **Encode request** | [`params`]: target format, size and quality |
//! | **Driver trait** | [`driver`]: [`Driver`], [`DriverId`], [`DriverError`] |
//! | **ImageMagick** | [`magick`]: `magick` CLI over stdin/stdout |
//! | **Pure Rust** | [`native`]: `image` crate decoders and encoders |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing one encode
//! - **Drivers**: [`Driver`] trait + [`ImagickDriver`] and [`NativeDriver`]

pub mod calculations;
pub mod driver;
mod format;
pub mod magick;
pub mod native;
mod params;

pub use calculations::{
    Dimensions, Orientation, aspect_ratio, classify_orientation, estimated_decode_bytes,
    fit_within, scale_to_fit,
};
pub use driver::{Driver, DriverError, DriverId, LimitKind};
pub use format::{Format, UnknownFormat};
pub use magick::ImagickDriver;
pub use native::NativeDriver;
pub use params::{EncodeRequest, Quality};
