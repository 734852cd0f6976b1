//! Transcoding configuration.
//!
//! One [`TranscodeConfig`] is loaded once at process start, merged over the
//! stock defaults, validated, and then passed by reference into each
//! component's constructor. Nothing reads configuration lazily.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! formats = ["webp", "jpeg"]   # Output formats, in priority order
//!
//! [[variants]]
//! name = "thumbnail"
//! max_dimension = 150          # Longer-edge bound; omit for "full"
//!
//! [drivers]
//! priority = ["imagick", "native"]
//!
//! [drivers.imagick]
//! binary = "magick"
//! formats = ["webp", "avif", "jpeg", "png", "gif", "bmp", "tiff"]
//!
//! [drivers.native]
//! formats = ["webp", "avif", "jpeg", "png", "gif", "bmp", "tiff"]
//!
//! [format_fallback]
//! avif = "webp"
//! webp = "jpeg"
//!
//! [fallback]
//! enabled = true
//! max_attempts = 3
//!
//! [limits]
//! max_width = 16384
//! max_height = 16384
//! max_area = 128000000
//! precedence = "tighter"
//!
//! [limits.imagick]             # Per-driver overrides
//! max_area = 64000000
//!
//! [encoding]
//! quality = 82
//!
//! [analysis]
//! square_tolerance = 0.05
//!
//! [processing]
//! max_processes = 4            # Omit for auto = CPU cores
//! ```
//!
//! ## Partial Configuration
//!
//! Config files are sparse: override just the values you want. Tables are
//! merged key by key; arrays (`formats`, `variants`, `drivers.priority`)
//! replace the default list entirely.
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::{Dimensions, DriverId, Format, Quality, scale_to_fit};
use crate::limits::ResourceLimits;
use crate::registry::FormatFallback;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Complete transcoding configuration.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscodeConfig {
    /// Output formats for every variant, in priority order.
    pub formats: Vec<Format>,
    /// Named size buckets, in order.
    pub variants: Vec<VariantSpec>,
    /// Driver priority and per-driver settings.
    pub drivers: DriversConfig,
    /// Format to try next when no driver can produce a format.
    /// Keys are format names; checked for cycles by [`validate`](Self::validate).
    pub format_fallback: BTreeMap<String, Format>,
    pub fallback: FallbackConfig,
    pub limits: ResourceLimits,
    pub encoding: EncodingConfig,
    pub analysis: AnalysisConfig,
    pub processing: ProcessingConfig,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            formats: vec![Format::Webp, Format::Jpeg],
            variants: default_variants(),
            drivers: DriversConfig::default(),
            format_fallback: BTreeMap::from([
                (Format::Avif.as_str().to_string(), Format::Webp),
                (Format::Webp.as_str().to_string(), Format::Jpeg),
            ]),
            fallback: FallbackConfig::default(),
            limits: ResourceLimits::default(),
            encoding: EncodingConfig::default(),
            analysis: AnalysisConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }
}

fn default_variants() -> Vec<VariantSpec> {
    vec![
        VariantSpec::bounded("thumbnail", 150),
        VariantSpec::bounded("small", 400),
        VariantSpec::bounded("medium", 800),
        VariantSpec::bounded("large", 1600),
        VariantSpec::full("full"),
    ]
}

impl TranscodeConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.formats.is_empty() {
            return Err(ConfigError::Validation("formats must not be empty".into()));
        }
        if self.variants.is_empty() {
            return Err(ConfigError::Validation("variants must not be empty".into()));
        }
        let mut names = HashSet::new();
        for variant in &self.variants {
            if variant.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "variant names must not be empty".into(),
                ));
            }
            if !names.insert(variant.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate variant name: {}",
                    variant.name
                )));
            }
            if variant.max_dimension == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "variants.{}.max_dimension must be non-zero",
                    variant.name
                )));
            }
        }
        if self.drivers.priority.is_empty() {
            return Err(ConfigError::Validation(
                "drivers.priority must not be empty".into(),
            ));
        }
        let mut seen = HashSet::new();
        for id in &self.drivers.priority {
            if !seen.insert(*id) {
                return Err(ConfigError::Validation(format!(
                    "drivers.priority lists {id} twice"
                )));
            }
        }
        if self.fallback.max_attempts == 0 && self.fallback.enabled {
            return Err(ConfigError::Validation(
                "fallback.max_attempts must be at least 1 when fallback is enabled".into(),
            ));
        }
        if !(1..=100).contains(&self.encoding.quality) {
            return Err(ConfigError::Validation(
                "encoding.quality must be 1-100".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.analysis.square_tolerance) {
            return Err(ConfigError::Validation(
                "analysis.square_tolerance must be in [0, 1)".into(),
            ));
        }
        self.limits.validate()?;
        self.fallback_map()?;
        Ok(())
    }

    /// The typed, cycle-checked format fallback map.
    pub fn fallback_map(&self) -> Result<FormatFallback, ConfigError> {
        FormatFallback::from_config(&self.format_fallback)
    }

    pub fn quality(&self) -> Quality {
        Quality::new(self.encoding.quality)
    }
}

/// A named size bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantSpec {
    pub name: String,
    /// Longer-edge bound in pixels. `None` keeps the source size, capped by
    /// the active resource limits.
    #[serde(default)]
    pub max_dimension: Option<u32>,
}

impl VariantSpec {
    pub fn bounded(name: impl Into<String>, max_dimension: u32) -> Self {
        Self {
            name: name.into(),
            max_dimension: Some(max_dimension),
        }
    }

    pub fn full(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_dimension: None,
        }
    }

    /// Output size for a source of `source` dimensions.
    pub fn target(&self, source: Dimensions) -> Dimensions {
        match self.max_dimension {
            Some(max) => scale_to_fit(source, max),
            None => source,
        }
    }
}

/// Driver priority and per-driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriversConfig {
    /// Drivers to probe, highest priority first.
    pub priority: Vec<DriverId>,
    pub imagick: ImagickConfig,
    pub native: NativeConfig,
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            priority: vec![DriverId::Imagick, DriverId::Native],
            imagick: ImagickConfig::default(),
            native: NativeConfig::default(),
        }
    }
}

impl DriversConfig {
    /// Configured format support for `id`, in the driver's preference order.
    pub fn formats(&self, id: DriverId) -> &[Format] {
        match id {
            DriverId::Imagick => &self.imagick.formats,
            DriverId::Native => &self.native.formats,
        }
    }
}

/// ImageMagick driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagickConfig {
    /// Executable name or path.
    pub binary: String,
    /// Kill a single `magick` invocation after this many seconds.
    pub timeout_secs: Option<u64>,
    pub formats: Vec<Format>,
}

impl Default for ImagickConfig {
    fn default() -> Self {
        Self {
            binary: "magick".to_string(),
            timeout_secs: None,
            formats: Format::ALL.to_vec(),
        }
    }
}

/// Pure-Rust driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NativeConfig {
    pub formats: Vec<Format>,
    /// Decoder allocation ceiling in bytes.
    pub max_alloc_bytes: Option<u64>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            formats: Format::ALL.to_vec(),
            max_alloc_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    /// Try the next format of the fallback map after every driver failed.
    pub enabled: bool,
    /// Maximum number of fallback formats tried in one call.
    pub max_attempts: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncodingConfig {
    /// Lossy encoding quality (1-100).
    pub quality: u32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            quality: Quality::default().value(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// `|ratio - 1|` at or below this counts as square.
    pub square_tolerance: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            square_tolerance: crate::imaging::calculations::DEFAULT_SQUARE_TOLERANCE,
        }
    }
}

/// Parallel processing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel transcoding workers.
    /// When absent or null, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.min(cores)).unwrap_or(cores)
}

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(TranscodeConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a config file as a raw TOML value.
pub fn load_raw_config(path: &Path) -> Result<toml::Value, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<TranscodeConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: TranscodeConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the process configuration.
///
/// With no path the stock defaults are used. A given path must exist.
pub fn load_config(path: Option<&Path>) -> Result<TranscodeConfig, ConfigError> {
    let base = stock_defaults_value();
    let overlay = path.map(load_raw_config).transpose()?;
    resolve_config(base, overlay)
}

/// Returns a fully-commented stock config file with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# picture-forge Configuration
# ===========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults.
#
# Tables are merged over the defaults key by key; arrays replace the
# default list entirely. Unknown keys will cause an error.

# Output formats produced for every variant, in priority order.
# Known formats: webp, avif, jpeg, png, gif, bmp, tiff
formats = ["webp", "jpeg"]

# ---------------------------------------------------------------------------
# Variants: named size buckets. max_dimension bounds the longer edge;
# omit it to keep the source size (still capped by [limits]).
# ---------------------------------------------------------------------------
[[variants]]
name = "thumbnail"
max_dimension = 150

[[variants]]
name = "small"
max_dimension = 400

[[variants]]
name = "medium"
max_dimension = 800

[[variants]]
name = "large"
max_dimension = 1600

[[variants]]
name = "full"

# ---------------------------------------------------------------------------
# Drivers
# ---------------------------------------------------------------------------
[drivers]
# Probed in this order; the first driver that is present and supports the
# requested format is tried first.
priority = ["imagick", "native"]

[drivers.imagick]
# ImageMagick 7 executable.
binary = "magick"
# Kill a single invocation after this many seconds (omit for no timeout).
# timeout_secs = 120
formats = ["webp", "avif", "jpeg", "png", "gif", "bmp", "tiff"]

[drivers.native]
formats = ["webp", "avif", "jpeg", "png", "gif", "bmp", "tiff"]
# Decoder allocation ceiling in bytes (omit for the image crate default).
# max_alloc_bytes = 536870912

# ---------------------------------------------------------------------------
# Format fallback: when no driver can produce a format, try the mapped one.
# Chains must end; cycles are rejected at startup.
# ---------------------------------------------------------------------------
[format_fallback]
avif = "webp"
webp = "jpeg"

[fallback]
enabled = true
# Maximum number of fallback formats tried in one call.
max_attempts = 3

# ---------------------------------------------------------------------------
# Resource limits, checked before any decode.
# ---------------------------------------------------------------------------
[limits]
max_width = 16384
max_height = 16384
# Pixels (128 MP).
max_area = 128000000
# Estimated decoded size (width * height * 4 bytes).
max_memory_bytes = 1073741824
# Raw source size.
max_source_bytes = 104857600
# How configured ceilings combine with a driver's own live limits:
#   "tighter"    - the smaller of the two (default)
#   "configured" - ignore live limits
#   "live"       - a live limit replaces the configured one
precedence = "tighter"

# Per-driver overrides of any ceiling above.
[limits.imagick]

[limits.native]

# ---------------------------------------------------------------------------
# Encoding
# ---------------------------------------------------------------------------
[encoding]
# Lossy encoding quality (1 = worst, 100 = best).
quality = 82

# ---------------------------------------------------------------------------
# Analysis
# ---------------------------------------------------------------------------
[analysis]
# An image is square when |width/height - 1| <= square_tolerance.
square_tolerance = 0.05

# ---------------------------------------------------------------------------
# Parallel processing
# ---------------------------------------------------------------------------
[processing]
# Maximum number of parallel transcoding workers.
# Omit or comment out to auto-detect (uses all CPU cores).
# Values larger than the number of cores are clamped down.
# max_processes = 4
"##
}
