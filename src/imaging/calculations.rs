//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

use serde::{Deserialize, Serialize};

/// Width and height of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count, widened so 65535² cannot overflow.
    pub fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Bytes per pixel of a decoded RGBA8 buffer, the layout both drivers
/// decode into before resizing.
pub const DECODED_BYTES_PER_PIXEL: u64 = 4;

/// Default tolerance for [`classify_orientation`].
pub const DEFAULT_SQUARE_TOLERANCE: f64 = 0.05;

/// Shape of an image relative to its aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
}

/// Width divided by height. `None` for degenerate dimensions.
pub fn aspect_ratio(dims: Dimensions) -> Option<f64> {
    if dims.is_empty() {
        return None;
    }
    Some(dims.width as f64 / dims.height as f64)
}

/// Classify an image as landscape, portrait or square.
///
/// An image is square when `|ratio - 1| <= tolerance`, so a 1000x1030 photo
/// still counts as square at the default tolerance of 0.05.
///
/// # Examples
/// ```
/// # use picture_forge::imaging::{Dimensions, Orientation, classify_orientation};
/// assert_eq!(classify_orientation(Dimensions::new(1600, 900), 0.05), Some(Orientation::Landscape));
/// assert_eq!(classify_orientation(Dimensions::new(1000, 1030), 0.05), Some(Orientation::Square));
/// ```
pub fn classify_orientation(dims: Dimensions, tolerance: f64) -> Option<Orientation> {
    let ratio = aspect_ratio(dims)?;
    if (ratio - 1.0).abs() <= tolerance {
        Some(Orientation::Square)
    } else if ratio > 1.0 {
        Some(Orientation::Landscape)
    } else {
        Some(Orientation::Portrait)
    }
}

/// Scale dimensions to fit inside a `max_width` x `max_height` box.
///
/// Preserves aspect ratio and never upscales: if the image already fits it
/// is returned unchanged. The constrained edge lands exactly on the bound,
/// the other edge is rounded and never drops below 1.
///
/// # Examples
/// ```
/// # use picture_forge::imaging::{Dimensions, fit_within};
/// // 4000x3000 into a 150px box → 150x113
/// assert_eq!(fit_within(Dimensions::new(4000, 3000), 150, 150), Dimensions::new(150, 113));
/// ```
pub fn fit_within(dims: Dimensions, max_width: u32, max_height: u32) -> Dimensions {
    if dims.is_empty() || (dims.width <= max_width && dims.height <= max_height) {
        return dims;
    }

    let (w, h) = (dims.width as u64, dims.height as u64);
    let (max_w, max_h) = (max_width.max(1) as u64, max_height.max(1) as u64);

    // Integer cross-multiplication so rounding is exact
    if w * max_h >= h * max_w {
        // Width is the binding edge
        let out_h = rounded_ratio(h, max_w, w).clamp(1, max_h);
        Dimensions::new(max_w as u32, out_h as u32)
    } else {
        // Height is the binding edge
        let out_w = rounded_ratio(w, max_h, h).clamp(1, max_w);
        Dimensions::new(out_w as u32, max_h as u32)
    }
}

/// `round(value * numerator / denominator)`, rounding halves up.
fn rounded_ratio(value: u64, numerator: u64, denominator: u64) -> u64 {
    (value * numerator + denominator / 2) / denominator
}

/// Scale dimensions so the longer edge is at most `max`.
///
/// Shorthand for [`fit_within`] with a square bounding box.
pub fn scale_to_fit(dims: Dimensions, max: u32) -> Dimensions {
    fit_within(dims, max, max)
}

/// Estimated size of the fully decoded pixel buffer.
pub fn estimated_decode_bytes(dims: Dimensions) -> u64 {
    dims.area().saturating_mul(DECODED_BYTES_PER_PIXEL)
}
