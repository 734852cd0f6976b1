//! Optimized variant catalog.
//!
//! Keeps one [`OptimizedVariant`] row per (source, variant, format) and
//! generates the rows a source is missing. The configured variants times the
//! configured formats form the matrix every source should eventually have.
//!
//! ## Materialization
//!
//! ```text
//! matrix ── minus existing rows ──► missing pairs
//!                                        │
//!                     ┌──────────────────┤ (rayon in materialize_parallel)
//!                     ▼                  ▼
//!                 transcode          transcode
//!                     │                  │
//!           storage.put + insert   failure logged, collected
//! ```
//!
//! A pair that fails is logged and reported; the others still run. Rows are
//! recorded under the format actually produced, so `(thumbnail, avif)` may
//! land as a `jpeg` row when AVIF is not producible. Such a pair counts as
//! present once the fallback row exists and is not transcoded again.
//!
//! ## Storage layout
//!
//! ```text
//! <root>/
//! ├── .variant-index.json        # IndexedRepository rows
//! └── <source-id>/
//!     ├── thumbnail.webp
//!     ├── thumbnail.jpg
//!     └── full.webp
//! ```

use crate::config::{TranscodeConfig, VariantSpec};
use crate::error::TranscodingFailure;
use crate::imaging::{DriverId, Format};
use crate::limits::ResourceLimits;
use crate::orchestrator::Transcoder;
use crate::source::SourceImage;
use crate::storage::{Storage, StorageError, VariantRepository};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One stored encoded output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizedVariant {
    pub source_id: String,
    pub variant: String,
    pub format: Format,
    /// Storage path of the encoded bytes.
    pub path: String,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub driver: DriverId,
}

impl OptimizedVariant {
    pub fn key(&self) -> VariantKey {
        VariantKey::new(&self.source_id, &self.variant, self.format)
    }
}

/// Uniqueness key of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariantKey {
    pub source_id: String,
    pub variant: String,
    pub format: Format,
}

impl VariantKey {
    pub fn new(source_id: &str, variant: &str, format: Format) -> Self {
        Self {
            source_id: source_id.to_string(),
            variant: variant.to_string(),
            format,
        }
    }
}

/// What a caller should serve for a requested variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Rendition<'a> {
    Variant(OptimizedVariant),
    /// No matching row; serve the unmodified source.
    Original(&'a SourceImage),
}

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("{0}")]
    Transcode(#[from] TranscodingFailure),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A (variant, format) pair that could not be materialized.
#[derive(Debug)]
pub struct PairFailure {
    pub variant: String,
    pub format: Format,
    pub error: MaterializeError,
}

/// Outcome of one materialize call.
#[derive(Debug, Default)]
pub struct MaterializeReport {
    pub source_id: String,
    pub created: Vec<OptimizedVariant>,
    /// Pairs already covered by a stored row.
    pub skipped: usize,
    pub failures: Vec<PairFailure>,
}

impl MaterializeReport {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, outcome: PairOutcome) {
        match outcome {
            PairOutcome::Created(row) => self.created.push(row),
            PairOutcome::Present => self.skipped += 1,
            PairOutcome::Failed(failure) => self.failures.push(failure),
        }
    }
}

enum PairOutcome {
    Created(OptimizedVariant),
    Present,
    Failed(PairFailure),
}

pub struct VariantCatalog {
    transcoder: Arc<Transcoder>,
    storage: Arc<dyn Storage>,
    repository: Arc<dyn VariantRepository>,
    variants: Vec<VariantSpec>,
    formats: Vec<Format>,
    limits: ResourceLimits,
}

impl VariantCatalog {
    pub fn new(
        transcoder: Arc<Transcoder>,
        storage: Arc<dyn Storage>,
        repository: Arc<dyn VariantRepository>,
        variants: Vec<VariantSpec>,
        formats: Vec<Format>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            transcoder,
            storage,
            repository,
            variants,
            formats,
            limits,
        }
    }

    pub fn from_config(
        transcoder: Arc<Transcoder>,
        storage: Arc<dyn Storage>,
        repository: Arc<dyn VariantRepository>,
        config: &TranscodeConfig,
    ) -> Self {
        Self::new(
            transcoder,
            storage,
            repository,
            config.variants.clone(),
            config.formats.clone(),
            config.limits.clone(),
        )
    }

    /// Every (variant, format) pair a source should have, variants first.
    pub fn matrix(&self) -> Vec<(&VariantSpec, Format)> {
        self.variants
            .iter()
            .flat_map(|variant| self.formats.iter().map(move |&format| (variant, format)))
            .collect()
    }

    /// Pairs of the matrix with no stored row for `source_id`.
    pub fn missing_for(&self, source_id: &str) -> Result<Vec<(&VariantSpec, Format)>, StorageError> {
        let existing = self.repository.list(source_id)?;
        Ok(self
            .matrix()
            .into_iter()
            .filter(|(variant, format)| {
                !existing
                    .iter()
                    .any(|row| row.variant == variant.name && row.format == *format)
            })
            .collect())
    }

    /// Generate every missing pair of `source`, one after another.
    pub fn materialize(&self, source: &SourceImage) -> Result<MaterializeReport, StorageError> {
        let missing = self.missing_for(source.id())?;
        let mut report = MaterializeReport::new(source.id());
        report.skipped = self.matrix().len() - missing.len();
        for (variant, format) in missing {
            report.record(self.materialize_pair(source, variant, format));
        }
        self.log_report(&report);
        Ok(report)
    }

    /// [`materialize`](Self::materialize) with pairs spread over the rayon
    /// pool. Created rows keep matrix order.
    pub fn materialize_parallel(
        &self,
        source: &SourceImage,
    ) -> Result<MaterializeReport, StorageError> {
        let missing = self.missing_for(source.id())?;
        let mut report = MaterializeReport::new(source.id());
        report.skipped = self.matrix().len() - missing.len();
        let outcomes: Vec<PairOutcome> = missing
            .into_par_iter()
            .map(|(variant, format)| self.materialize_pair(source, variant, format))
            .collect();
        for outcome in outcomes {
            report.record(outcome);
        }
        self.log_report(&report);
        Ok(report)
    }

    fn materialize_pair(
        &self,
        source: &SourceImage,
        variant: &VariantSpec,
        format: Format,
    ) -> PairOutcome {
        match self.try_materialize_pair(source, variant, format) {
            Ok(Some(row)) => PairOutcome::Created(row),
            Ok(None) => PairOutcome::Present,
            Err(error) => {
                warn!(
                    source = source.id(),
                    variant = %variant.name,
                    %format,
                    error = %error,
                    "variant not materialized"
                );
                PairOutcome::Failed(PairFailure {
                    variant: variant.name.clone(),
                    format,
                    error,
                })
            }
        }
    }

    /// `Ok(None)` when a row covering the pair already exists.
    fn try_materialize_pair(
        &self,
        source: &SourceImage,
        variant: &VariantSpec,
        format: Format,
    ) -> Result<Option<OptimizedVariant>, MaterializeError> {
        if self.is_covered(source.id(), &variant.name, format)? {
            debug!(source = source.id(), variant = %variant.name, %format, "already present");
            return Ok(None);
        }

        let encoded = self
            .transcoder
            .transcode(source, variant, format, &self.limits)?;
        let path = storage_path(source.id(), &variant.name, encoded.format);
        let path = self.storage.put(&path, &encoded.bytes)?;
        let row = OptimizedVariant {
            source_id: source.id().to_string(),
            variant: variant.name.clone(),
            format: encoded.format,
            path,
            byte_size: encoded.bytes.len() as u64,
            width: encoded.width,
            height: encoded.height,
            driver: encoded.driver,
        };
        if self.repository.insert(row.clone())? {
            Ok(Some(row))
        } else {
            Ok(None)
        }
    }

    /// Whether a row exists for the pair itself, or for the format a
    /// transcode of it would fall back to.
    fn is_covered(&self, source_id: &str, variant: &str, format: Format) -> Result<bool, StorageError> {
        if self.repository.find(source_id, variant, format)?.is_some() {
            return Ok(true);
        }
        match self.transcoder.registry().candidates_for_format(format) {
            Some(candidates) if candidates.is_fallback() => Ok(self
                .repository
                .find(source_id, variant, candidates.format)?
                .is_some()),
            _ => Ok(false),
        }
    }

    fn log_report(&self, report: &MaterializeReport) {
        info!(
            source = %report.source_id,
            created = report.created.len(),
            skipped = report.skipped,
            failed = report.failures.len(),
            "materialized"
        );
    }

    /// Best stored rendition of `variant`, trying `preferred` formats in
    /// order. Falls back to `original` when no row matches.
    pub fn select_rendition<'a>(
        &self,
        source_id: &str,
        variant: &str,
        preferred: &[Format],
        original: Option<&'a SourceImage>,
    ) -> Result<Option<Rendition<'a>>, StorageError> {
        for &format in preferred {
            if let Some(row) = self.repository.find(source_id, variant, format)? {
                return Ok(Some(Rendition::Variant(row)));
            }
        }
        Ok(original.map(Rendition::Original))
    }

    /// Delete every row of `source_id` and the bytes they point to.
    /// Returns the number of rows removed.
    ///
    /// Bytes go first. If any delete fails the rows stay, so a later call
    /// can finish the job.
    pub fn remove_source(&self, source_id: &str) -> Result<usize, StorageError> {
        let rows = self.repository.list(source_id)?;
        let mut first_error = None;
        for row in &rows {
            if let Err(e) = self.storage.delete(&row.path) {
                warn!(source = source_id, path = %row.path, error = %e, "failed to delete variant bytes");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        let removed = self.repository.remove_source(source_id)?;
        info!(source = source_id, removed = removed.len(), "source removed");
        Ok(removed.len())
    }

    pub fn rows(&self, source_id: &str) -> Result<Vec<OptimizedVariant>, StorageError> {
        self.repository.list(source_id)
    }
}

/// `<source-id>/<variant>.<ext>`
pub fn storage_path(source_id: &str, variant: &str, format: Format) -> String {
    format!("{source_id}/{variant}.{}", format.extension())
}
