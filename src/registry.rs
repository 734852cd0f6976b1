//! Driver capability registry.
//!
//! The registry is the single answer to "which drivers exist here, and what
//! can each one produce". It owns the constructed drivers, in configured
//! priority order, together with each driver's format support list and the
//! format fallback map.
//!
//! Detection probes the host once. The result lives in a [`OnceLock`], so
//! concurrent first callers still probe exactly once and every later call
//! is a read. A process restart is the only way to re-detect.
//!
//! ```text
//! candidates_for_format(avif)
//!   avif → [] (no driver)       ─┐ fallback map
//!   webp → [] (no driver)        │
//!   jpeg → [imagick, native]  ◄──┘
//! ```

use crate::config::{ConfigError, DriversConfig, TranscodeConfig};
use crate::imaging::{Driver, DriverId, Format, ImagickDriver, NativeDriver};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No drivers available (probed: {})", join_ids(.probed))]
    NoDriversAvailable { probed: Vec<DriverId> },
    #[error("Driver {0} is not registered")]
    NotRegistered(DriverId),
}

fn join_ids(ids: &[DriverId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One driver as seen at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverDescriptor {
    pub id: DriverId,
    /// Configured format support, in the driver's preference order.
    pub formats: Vec<Format>,
    /// Whether the probe found the driver on this host.
    pub available: bool,
}

/// Drivers able to produce `format`, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSet {
    /// The format the caller asked for.
    pub requested: Format,
    /// The format these drivers produce; differs from `requested` after a
    /// format fallback.
    pub format: Format,
    pub drivers: Vec<DriverId>,
}

impl CandidateSet {
    pub fn is_fallback(&self) -> bool {
        self.format != self.requested
    }
}

/// Validated format fallback map.
///
/// Every chain terminates: cycles and self-loops are rejected at
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatFallback {
    next: BTreeMap<Format, Format>,
}

impl FormatFallback {
    pub fn new(pairs: impl IntoIterator<Item = (Format, Format)>) -> Result<Self, ConfigError> {
        let next: BTreeMap<Format, Format> = pairs.into_iter().collect();
        for (&from, &to) in &next {
            if from == to {
                return Err(ConfigError::Validation(format!(
                    "format_fallback.{from} falls back to itself"
                )));
            }
        }
        for &start in next.keys() {
            let mut seen = vec![start];
            let mut current = start;
            while let Some(&to) = next.get(&current) {
                if seen.contains(&to) {
                    seen.push(to);
                    let path: Vec<&str> = seen.iter().map(|f| f.as_str()).collect();
                    return Err(ConfigError::Validation(format!(
                        "format_fallback has a cycle: {}",
                        path.join(" -> ")
                    )));
                }
                seen.push(to);
                current = to;
            }
        }
        Ok(Self { next })
    }

    /// Build from the raw `[format_fallback]` table, whose keys are format
    /// names.
    pub fn from_config(raw: &BTreeMap<String, Format>) -> Result<Self, ConfigError> {
        let mut pairs = Vec::with_capacity(raw.len());
        for (key, &to) in raw {
            let from: Format = key.parse().map_err(|_| {
                ConfigError::Validation(format!("format_fallback: unknown format '{key}'"))
            })?;
            pairs.push((from, to));
        }
        Self::new(pairs)
    }

    pub fn next(&self, format: Format) -> Option<Format> {
        self.next.get(&format).copied()
    }

    /// Every format after `format`, following the map to its end.
    pub fn chain(&self, format: Format) -> Vec<Format> {
        let mut chain = Vec::new();
        let mut current = format;
        while let Some(to) = self.next(current) {
            chain.push(to);
            current = to;
        }
        chain
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}

struct RegisteredDriver {
    driver: Arc<dyn Driver>,
    formats: Vec<Format>,
}

/// Registry of constructed drivers.
pub struct DriverRegistry {
    /// Priority order.
    drivers: Vec<RegisteredDriver>,
    fallback: FormatFallback,
    fallback_enabled: bool,
    max_attempts: u32,
    detected: OnceLock<Vec<DriverId>>,
}

/// Constructor table: the only place a driver id becomes a driver.
fn build_driver(id: DriverId, config: &DriversConfig) -> Arc<dyn Driver> {
    match id {
        DriverId::Imagick => Arc::new(ImagickDriver::from_config(&config.imagick)),
        DriverId::Native => Arc::new(match config.native.max_alloc_bytes {
            Some(max) => NativeDriver::with_max_alloc(max),
            None => NativeDriver::new(),
        }),
    }
}

impl DriverRegistry {
    /// Construct every driver named in `drivers.priority`.
    pub fn from_config(config: &TranscodeConfig) -> Result<Self, ConfigError> {
        let mut builder = Self::builder()
            .fallback(config.fallback_map()?)
            .fallback_policy(config.fallback.enabled, config.fallback.max_attempts);
        for &id in &config.drivers.priority {
            builder = builder.driver(
                build_driver(id, &config.drivers),
                config.drivers.formats(id),
            );
        }
        Ok(builder.build())
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Probe every driver in priority order and return those present.
    ///
    /// Probing happens on the first call only.
    pub fn detect(&self) -> Result<&[DriverId], RegistryError> {
        let detected = self.detected.get_or_init(|| {
            let found: Vec<DriverId> = self
                .drivers
                .iter()
                .filter(|entry| {
                    let id = entry.driver.id();
                    let present = entry.driver.probe();
                    debug!(driver = %id, present, "driver probe");
                    present
                })
                .map(|entry| entry.driver.id())
                .collect();
            info!(drivers = %join_ids(&found), "driver detection complete");
            found
        });
        if detected.is_empty() {
            return Err(RegistryError::NoDriversAvailable {
                probed: self.drivers.iter().map(|e| e.driver.id()).collect(),
            });
        }
        Ok(detected)
    }

    /// Configured support lookup. No probing.
    pub fn supports_format(&self, driver: DriverId, format: Format) -> bool {
        self.entry(driver)
            .is_some_and(|entry| entry.formats.contains(&format))
    }

    /// Detected drivers supporting exactly `format`, in priority order.
    pub fn drivers_for(&self, format: Format) -> Vec<DriverId> {
        self.detect()
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|&id| self.supports_format(id, format))
            .collect()
    }

    /// Drivers for `format`, or for the first format down the fallback
    /// chain that has any. `None` when no reachable format has a driver.
    pub fn candidates_for_format(&self, format: Format) -> Option<CandidateSet> {
        std::iter::once(format)
            .chain(self.fallback_chain(format))
            .find_map(|candidate| {
                let drivers = self.drivers_for(candidate);
                (!drivers.is_empty()).then(|| CandidateSet {
                    requested: format,
                    format: candidate,
                    drivers,
                })
            })
    }

    /// Formats to try after `format`, bounded by `fallback.max_attempts`.
    /// Empty when fallback is disabled.
    pub fn fallback_chain(&self, format: Format) -> Vec<Format> {
        if !self.fallback_enabled {
            return Vec::new();
        }
        let mut chain = self.fallback.chain(format);
        chain.truncate(self.max_attempts as usize);
        chain
    }

    /// First detected driver; used for format-independent work such as
    /// dimension probing.
    pub fn primary(&self) -> Result<DriverId, RegistryError> {
        let detected = self.detect()?;
        detected
            .first()
            .copied()
            .ok_or_else(|| RegistryError::NoDriversAvailable { probed: Vec::new() })
    }

    pub fn driver(&self, id: DriverId) -> Option<&dyn Driver> {
        self.entry(id).map(|entry| entry.driver.as_ref())
    }

    /// Every registered driver, in priority order, with its availability.
    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        let detected = self.detect().unwrap_or_default();
        self.drivers
            .iter()
            .map(|entry| {
                let id = entry.driver.id();
                DriverDescriptor {
                    id,
                    formats: entry.formats.clone(),
                    available: detected.contains(&id),
                }
            })
            .collect()
    }

    /// Every format some detected driver can produce.
    pub fn producible_formats(&self) -> BTreeSet<Format> {
        self.detect()
            .unwrap_or_default()
            .iter()
            .filter_map(|&id| self.entry(id))
            .flat_map(|entry| entry.formats.iter().copied())
            .collect()
    }

    fn entry(&self, id: DriverId) -> Option<&RegisteredDriver> {
        self.drivers.iter().find(|entry| entry.driver.id() == id)
    }
}

/// Builder for a [`DriverRegistry`], used by
/// [`DriverRegistry::from_config`] and to inject drivers in tests.
pub struct RegistryBuilder {
    drivers: Vec<RegisteredDriver>,
    fallback: FormatFallback,
    fallback_enabled: bool,
    max_attempts: u32,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            drivers: Vec::new(),
            fallback: FormatFallback::default(),
            fallback_enabled: true,
            max_attempts: 3,
        }
    }
}

impl RegistryBuilder {
    /// Register a driver at the next priority. A second driver with the
    /// same id is ignored.
    pub fn driver(mut self, driver: Arc<dyn Driver>, formats: &[Format]) -> Self {
        let id = driver.id();
        if self.drivers.iter().all(|entry| entry.driver.id() != id) {
            self.drivers.push(RegisteredDriver {
                driver,
                formats: formats.to_vec(),
            });
        }
        self
    }

    pub fn fallback(mut self, fallback: FormatFallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn fallback_policy(mut self, enabled: bool, max_attempts: u32) -> Self {
        self.fallback_enabled = enabled;
        self.max_attempts = max_attempts;
        self
    }

    pub fn build(self) -> DriverRegistry {
        DriverRegistry {
            drivers: self.drivers,
            fallback: self.fallback,
            fallback_enabled: self.fallback_enabled,
            max_attempts: self.max_attempts,
            detected: OnceLock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::driver::tests::{MockDriver, RecordedOp};

    fn avif_webp_jpeg() -> FormatFallback {
        FormatFallback::new([(Format::Avif, Format::Webp), (Format::Webp, Format::Jpeg)]).unwrap()
    }

    // =========================================================================
    // FormatFallback
    // =========================================================================

    #[test]
    fn fallback_chain_follows_map() {
        let fallback = avif_webp_jpeg();
        assert_eq!(fallback.chain(Format::Avif), vec![Format::Webp, Format::Jpeg]);
        assert_eq!(fallback.chain(Format::Webp), vec![Format::Jpeg]);
        assert!(fallback.chain(Format::Jpeg).is_empty());
    }

    #[test]
    fn fallback_rejects_self_loop() {
        let err = FormatFallback::new([(Format::Png, Format::Png)]).unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn fallback_rejects_cycle() {
        let err = FormatFallback::new([
            (Format::Avif, Format::Webp),
            (Format::Webp, Format::Jpeg),
            (Format::Jpeg, Format::Avif),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn fallback_from_config_parses_keys() {
        let raw = BTreeMap::from([
            ("avif".to_string(), Format::Webp),
            ("tif".to_string(), Format::Png),
        ]);
        let fallback = FormatFallback::from_config(&raw).unwrap();
        assert_eq!(fallback.next(Format::Avif), Some(Format::Webp));
        assert_eq!(fallback.next(Format::Tiff), Some(Format::Png));
    }

    #[test]
    fn fallback_from_config_rejects_unknown_key() {
        let raw = BTreeMap::from([("heic".to_string(), Format::Jpeg)]);
        assert!(FormatFallback::from_config(&raw).is_err());
    }

    // =========================================================================
    // Detection
    // =========================================================================

    #[test]
    fn detect_keeps_priority_order_and_skips_absent() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Imagick).unavailable()), &[Format::Webp])
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Webp])
            .build();
        assert_eq!(registry.detect().unwrap(), &[DriverId::Native]);
        assert_eq!(registry.primary().unwrap(), DriverId::Native);
    }

    #[test]
    fn detect_fails_hard_when_nothing_present() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Imagick).unavailable()), &[Format::Webp])
            .build();
        let err = registry.detect().unwrap_err();
        assert_eq!(
            err,
            RegistryError::NoDriversAvailable {
                probed: vec![DriverId::Imagick]
            }
        );
        assert!(err.to_string().contains("imagick"));
        assert!(registry.primary().is_err());
    }

    #[test]
    fn detect_probes_once() {
        let mock = Arc::new(MockDriver::new(DriverId::Native));
        let registry = DriverRegistry::builder()
            .driver(mock.clone(), &[Format::Png])
            .build();

        registry.detect().unwrap();
        registry.detect().unwrap();
        registry.candidates_for_format(Format::Png);

        let probes = mock
            .get_operations()
            .into_iter()
            .filter(|op| *op == RecordedOp::Probe)
            .count();
        assert_eq!(probes, 1);
    }

    #[test]
    fn detect_probes_once_under_concurrent_first_access() {
        let mock = Arc::new(MockDriver::new(DriverId::Native));
        let registry = Arc::new(
            DriverRegistry::builder()
                .driver(mock.clone(), &[Format::Png])
                .build(),
        );

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    registry.detect().unwrap();
                });
            }
        });

        let probes = mock
            .get_operations()
            .into_iter()
            .filter(|op| *op == RecordedOp::Probe)
            .count();
        assert_eq!(probes, 1);
    }

    // =========================================================================
    // Candidate selection
    // =========================================================================

    #[test]
    fn supports_format_is_config_lookup() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Native).unavailable()), &[Format::Png])
            .build();
        // Support is configuration, not availability
        assert!(registry.supports_format(DriverId::Native, Format::Png));
        assert!(!registry.supports_format(DriverId::Native, Format::Avif));
        assert!(!registry.supports_format(DriverId::Imagick, Format::Png));
    }

    #[test]
    fn candidates_preserve_priority() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Imagick)), &[Format::Webp, Format::Avif])
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Webp])
            .build();

        let set = registry.candidates_for_format(Format::Webp).unwrap();
        assert_eq!(set.drivers, vec![DriverId::Imagick, DriverId::Native]);
        assert!(!set.is_fallback());

        let set = registry.candidates_for_format(Format::Avif).unwrap();
        assert_eq!(set.drivers, vec![DriverId::Imagick]);
    }

    #[test]
    fn candidates_walk_fallback_map() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Jpeg])
            .fallback(avif_webp_jpeg())
            .build();

        let set = registry.candidates_for_format(Format::Avif).unwrap();
        assert_eq!(set.requested, Format::Avif);
        assert_eq!(set.format, Format::Jpeg);
        assert!(set.is_fallback());
    }

    #[test]
    fn candidates_none_without_viable_fallback() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Png])
            .fallback(avif_webp_jpeg())
            .build();
        assert_eq!(registry.candidates_for_format(Format::Avif), None);
    }

    #[test]
    fn disabled_fallback_has_no_chain() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Jpeg])
            .fallback(avif_webp_jpeg())
            .fallback_policy(false, 3)
            .build();
        assert!(registry.fallback_chain(Format::Avif).is_empty());
        assert_eq!(registry.candidates_for_format(Format::Avif), None);
    }

    #[test]
    fn max_attempts_bounds_chain() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Jpeg])
            .fallback(avif_webp_jpeg())
            .fallback_policy(true, 1)
            .build();
        assert_eq!(registry.fallback_chain(Format::Avif), vec![Format::Webp]);
        assert_eq!(registry.candidates_for_format(Format::Avif), None);
    }

    #[test]
    fn descriptors_report_availability() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Imagick).unavailable()), &[Format::Avif])
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Png, Format::Jpeg])
            .build();

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].id, DriverId::Imagick);
        assert!(!descriptors[0].available);
        assert!(descriptors[1].available);
        assert_eq!(descriptors[1].formats, vec![Format::Png, Format::Jpeg]);
        assert_eq!(
            registry.producible_formats(),
            BTreeSet::from([Format::Png, Format::Jpeg])
        );
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let registry = DriverRegistry::builder()
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Png])
            .driver(Arc::new(MockDriver::new(DriverId::Native)), &[Format::Jpeg])
            .build();
        assert_eq!(registry.descriptors().len(), 1);
        assert!(!registry.supports_format(DriverId::Native, Format::Jpeg));
    }

    #[test]
    fn from_config_builds_priority_list() {
        let mut config = TranscodeConfig::default();
        config.drivers.priority = vec![DriverId::Native];
        let registry = DriverRegistry::from_config(&config).unwrap();

        assert!(registry.driver(DriverId::Native).is_some());
        assert!(registry.driver(DriverId::Imagick).is_none());
        // The native driver is always present
        assert_eq!(registry.detect().unwrap(), &[DriverId::Native]);
    }
}
