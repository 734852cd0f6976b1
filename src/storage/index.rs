//! Variant repository backed by a JSON index file.
//!
//! The index lives at `<root>/.variant-index.json`, next to the files a
//! [`LocalStorage`](super::LocalStorage) writes, so the two travel
//! together when the output directory is copied or cached.
//!
//! A missing, corrupt, or outdated index loads as empty. The catalog then
//! sees every pair as missing and regenerates it, which overwrites the old
//! files in place.

use super::{RowSet, StorageError, VariantRepository};
use crate::catalog::OptimizedVariant;
use crate::imaging::Format;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Name of the index file within the storage root.
const INDEX_FILENAME: &str = ".variant-index.json";

/// Bump to discard every existing index when the row layout changes.
const INDEX_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct IndexFile {
    version: u32,
    rows: Vec<OptimizedVariant>,
}

#[derive(Debug)]
pub struct IndexedRepository {
    path: PathBuf,
    rows: Mutex<RowSet>,
}

impl IndexedRepository {
    /// Open the index under `root`, starting empty when none is usable.
    pub fn open(root: &Path) -> Self {
        let path = root.join(INDEX_FILENAME);
        let rows = load_rows(&path);
        Self {
            path,
            rows: Mutex::new(rows),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.path
    }

    fn save(&self, rows: &RowSet) -> Result<(), StorageError> {
        let file = IndexFile {
            version: INDEX_VERSION,
            rows: rows.rows().cloned().collect(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

fn load_rows(path: &Path) -> RowSet {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return RowSet::default(),
    };
    let file: IndexFile = match serde_json::from_str(&content) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable variant index, starting empty");
            return RowSet::default();
        }
    };
    if file.version != INDEX_VERSION {
        warn!(
            path = %path.display(),
            found = file.version,
            expected = INDEX_VERSION,
            "variant index version mismatch, starting empty"
        );
        return RowSet::default();
    }
    RowSet::from_rows(file.rows)
}

impl VariantRepository for IndexedRepository {
    fn list(&self, source_id: &str) -> Result<Vec<OptimizedVariant>, StorageError> {
        let rows = self.rows.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(rows.list(source_id))
    }

    fn find(
        &self,
        source_id: &str,
        variant: &str,
        format: Format,
    ) -> Result<Option<OptimizedVariant>, StorageError> {
        let rows = self.rows.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(rows.find(source_id, variant, format))
    }

    fn insert(&self, row: OptimizedVariant) -> Result<bool, StorageError> {
        let mut rows = self.rows.lock().map_err(|_| StorageError::Poisoned)?;
        // Memory only changes once the index on disk agrees
        let mut next = rows.clone();
        if !next.insert(row) {
            return Ok(false);
        }
        self.save(&next)?;
        *rows = next;
        Ok(true)
    }

    fn remove_source(&self, source_id: &str) -> Result<Vec<OptimizedVariant>, StorageError> {
        let mut rows = self.rows.lock().map_err(|_| StorageError::Poisoned)?;
        let mut next = rows.clone();
        let removed = next.remove_source(source_id);
        if !removed.is_empty() {
            self.save(&next)?;
            *rows = next;
        }
        Ok(removed)
    }
}
