//! Storage collaborators.
//!
//! The catalog never touches the filesystem directly. Encoded bytes go
//! through a [`Storage`] and variant rows through a [`VariantRepository`],
//! so a deployment can back either with whatever it already runs.
//!
//! | Trait | Implementations |
//! |---|---|
//! | [`Storage`] | [`LocalStorage`] (directory tree), [`MemoryStorage`] |
//! | [`VariantRepository`] | [`IndexedRepository`] (JSON index file), [`MemoryVariantRepository`] |

mod index;

pub use index::IndexedRepository;

use crate::catalog::{OptimizedVariant, VariantKey};
use crate::imaging::Format;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
    #[error("Index error: {0}")]
    Index(#[from] serde_json::Error),
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Byte storage addressed by relative paths such as `photo/thumbnail.webp`.
pub trait Storage: Send + Sync {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `bytes`, replacing any previous content, and return the path
    /// under which they can be read back.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError>;

    /// Remove `path`. Removing a missing path is not an error.
    fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Reject absolute paths and any component that could leave the root.
fn checked_relative(path: &str) -> Result<&Path, StorageError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|component| matches!(component, Component::Normal(_)));
    if ok {
        Ok(p)
    } else {
        Err(StorageError::InvalidPath(path.to_string()))
    }
}

/// Files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(checked_relative(path)?))
    }
}

impl Storage for LocalStorage {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            _ => StorageError::Io(e),
        })
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let full = self.resolve(path)?;
        let parent = full.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent)?;
        // Uniquely named sibling, renamed into place: readers never see a
        // partial file and concurrent writers never share one
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.persist(&full).map_err(|e| e.error)?;
        Ok(path.to_string())
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process storage for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files
            .lock()
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let files = self.files.lock().map_err(|_| StorageError::Poisoned)?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError> {
        checked_relative(path)?;
        let mut files = self.files.lock().map_err(|_| StorageError::Poisoned)?;
        files.insert(path.to_string(), bytes.to_vec());
        Ok(path.to_string())
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut files = self.files.lock().map_err(|_| StorageError::Poisoned)?;
        files.remove(path);
        Ok(())
    }
}

/// Persistence of [`OptimizedVariant`] rows, unique by
/// (source, variant, format).
pub trait VariantRepository: Send + Sync {
    /// Every row of one source.
    fn list(&self, source_id: &str) -> Result<Vec<OptimizedVariant>, StorageError>;

    fn find(
        &self,
        source_id: &str,
        variant: &str,
        format: Format,
    ) -> Result<Option<OptimizedVariant>, StorageError>;

    /// Insert `row` unless its key exists. Returns whether a row was created.
    fn insert(&self, row: OptimizedVariant) -> Result<bool, StorageError>;

    /// Delete every row of one source and return them.
    fn remove_source(&self, source_id: &str) -> Result<Vec<OptimizedVariant>, StorageError>;
}

/// Rows kept in a map; shared logic for both repositories.
#[derive(Debug, Default, Clone)]
pub(crate) struct RowSet {
    rows: BTreeMap<VariantKey, OptimizedVariant>,
}

impl RowSet {
    pub(crate) fn from_rows(rows: impl IntoIterator<Item = OptimizedVariant>) -> Self {
        Self {
            rows: rows.into_iter().map(|row| (row.key(), row)).collect(),
        }
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &OptimizedVariant> {
        self.rows.values()
    }

    fn list(&self, source_id: &str) -> Vec<OptimizedVariant> {
        self.rows
            .values()
            .filter(|row| row.source_id == source_id)
            .cloned()
            .collect()
    }

    fn find(&self, source_id: &str, variant: &str, format: Format) -> Option<OptimizedVariant> {
        self.rows
            .get(&VariantKey::new(source_id, variant, format))
            .cloned()
    }

    fn insert(&mut self, row: OptimizedVariant) -> bool {
        let key = row.key();
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(key, row);
        true
    }

    fn remove_source(&mut self, source_id: &str) -> Vec<OptimizedVariant> {
        let keys: Vec<VariantKey> = self
            .rows
            .keys()
            .filter(|key| key.source_id == source_id)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| self.rows.remove(key)).collect()
    }
}

/// In-process repository.
#[derive(Debug, Default)]
pub struct MemoryVariantRepository {
    rows: Mutex<RowSet>,
}

impl MemoryVariantRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VariantRepository for MemoryVariantRepository {
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
        Ok(rows.insert(row))
    }

    fn remove_source(&self, source_id: &str) -> Result<Vec<OptimizedVariant>, StorageError> {
        let mut rows = self.rows.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(rows.remove_source(source_id))
    }
}
