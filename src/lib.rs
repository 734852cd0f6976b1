//! # Picture Forge
//!
//! Image transcoding across interchangeable backends. A source image goes in;
//! a resized, re-encoded variant comes out of whichever backend can produce
//! it on this host, or a documented failure explains why none could.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────┐
//!   SourceImage ──►│ Transcoder           │──► EncodedImage
//!                  │  candidate selection │
//!                  │  admission check ────┼──► ResourceLimitGuard ──► DimensionAnalyzer
//!                  │  encode attempts ────┼──► Driver (imagick | native)
//!                  └──────────┬───────────┘
//!                             │ drivers, formats, fallback map
//!                             ▼
//!                      DriverRegistry
//!
//!   VariantCatalog ── for every missing (variant, format) ──► Transcoder
//!        │
//!        └──► Storage (bytes) + VariantRepository (rows)
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`imaging`] | The [`Driver`](imaging::Driver) seam, the ImageMagick and native drivers, formats, size arithmetic |
//! | [`registry`] | Driver detection (once per process), format support, fallback chains |
//! | [`analyzer`] | Header-first dimension reading and orientation |
//! | [`limits`] | Configured and live ceilings, admission control |
//! | [`orchestrator`] | One transcode: driver fallback, format fallback, failure aggregation |
//! | [`catalog`] | Variant × format matrix per source, materialization, rendition selection |
//! | [`storage`] | Byte storage and variant row persistence |
//! | [`source`] | Immutable source images with cached dimensions |
//! | [`error`] | Failure kinds, severities and the structured failure value |
//! | [`events`] | Fallback notifications |
//! | [`config`] | `config.toml` loading, merging onto stock defaults, validation |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Two Drivers, One Trait
//!
//! ImageMagick covers the most formats and reports its own resource ceilings;
//! the native driver needs nothing installed. Both sit behind
//! [`imaging::Driver`], and the set of drivers is closed: adding one means a
//! new [`DriverId`](imaging::DriverId) variant and a constructor arm in the
//! registry.
//!
//! ## Fail Fast on Resources, Fall Back on Everything Else
//!
//! A source over a ceiling is over it for every driver, so admission and
//! memory failures end a transcode immediately. Encoder failures, missing
//! delegates and empty output move on to the next driver, then down the
//! format fallback chain. Every fallback is logged and counted.
//!
//! ## Logging
//!
//! The library logs through `tracing` and never installs a subscriber. The
//! binary writes to stderr, filtered by `RUST_LOG`.

pub mod analyzer;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod imaging;
pub mod limits;
pub mod orchestrator;
pub mod output;
pub mod registry;
pub mod source;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_helpers;
