//! Source images.
//!
//! A [`SourceImage`] is an uploaded original. Its bytes never change after
//! construction; replacing an image means building a new `SourceImage`.
//! Dimensions are derived on first use and cached, so admission control for
//! several drivers and variants parses the header once.
//!
//! Files found by [`collect_sources`] are identified by their path relative
//! to the input they were found under, extension included:
//!
//! ```text
//! photos/                      ids
//! ├── dawn.jpg                 dawn.jpg
//! ├── dawn.png                 dawn.png
//! └── trip/dawn.jpg            trip/dawn.jpg
//! ```

use crate::analyzer::{AnalyzeError, DimensionAnalyzer};
use crate::imaging::{Dimensions, Format};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use walkdir::WalkDir;

#[derive(Clone)]
pub struct SourceImage {
    id: String,
    bytes: Arc<[u8]>,
    checksum: String,
    dimensions: OnceLock<Dimensions>,
}

impl SourceImage {
    pub fn new(id: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            id: id.into(),
            checksum: hash_bytes(&bytes),
            bytes,
            dimensions: OnceLock::new(),
        }
    }

    /// Read a file; the id is its file name.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let id = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_file(&SourceFile {
            id,
            path: path.to_path_buf(),
        })
    }

    pub fn from_file(file: &SourceFile) -> std::io::Result<Self> {
        let bytes = std::fs::read(&file.path)?;
        Ok(Self::new(file.id.clone(), bytes))
    }

    /// Seed the dimensions from an earlier analysis of the same content,
    /// e.g. a stored picture record.
    pub fn with_known_dimensions(self, dims: Dimensions) -> Self {
        let _ = self.dimensions.set(dims);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// SHA-256 of the content, lowercase hex.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Dimensions if they have been computed or seeded.
    pub fn known_dimensions(&self) -> Option<Dimensions> {
        self.dimensions.get().copied()
    }

    /// Dimensions, computing and caching them on first call.
    pub fn dimensions_with(&self, analyzer: &DimensionAnalyzer) -> Result<Dimensions, AnalyzeError> {
        if let Some(dims) = self.dimensions.get() {
            return Ok(*dims);
        }
        let dims = analyzer.dimensions(&self.bytes)?;
        Ok(*self.dimensions.get_or_init(|| dims))
    }
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceImage")
            .field("id", &self.id)
            .field("byte_size", &self.bytes.len())
            .field("checksum", &self.checksum)
            .field("dimensions", &self.dimensions.get())
            .finish()
    }
}

/// Two sources are equal when they share an id and content.
impl PartialEq for SourceImage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.checksum == other.checksum
    }
}

impl Eq for SourceImage {}

/// An image file found on disk and the id it will be catalogued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub id: String,
    pub path: PathBuf,
}

/// Image files under `inputs`, directories walked recursively in name order.
///
/// A directory equal to `exclude` is not descended into, so a store kept
/// inside an input tree is not read back as sources.
pub fn collect_sources(inputs: &[PathBuf], exclude: Option<&Path>) -> Vec<SourceFile> {
    let excluded = exclude.and_then(|p| p.canonicalize().ok());
    let mut files = Vec::new();
    for input in inputs {
        let root = if input.is_dir() {
            input.as_path()
        } else {
            input.parent().unwrap_or(Path::new(""))
        };
        let walker = WalkDir::new(input)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && excluded.is_some()
                    && entry.path().canonicalize().ok() == excluded)
            });
        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if entry.file_type().is_file() && is_image(path) {
                files.push(SourceFile {
                    id: relative_id(root, path),
                    path: path.to_path_buf(),
                });
            }
        }
    }
    files
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.parse::<Format>().is_ok())
}

/// `path` relative to `root`, `/`-separated.
fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// SHA-256 of `bytes`, lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checksum_is_sha256_hex() {
        let source = SourceImage::new("a", b"abc".to_vec());
        assert_eq!(
            source.checksum(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(source.byte_size(), 3);
    }

    #[test]
    fn checksum_changes_with_content() {
        let a = SourceImage::new("x", b"one".to_vec());
        let b = SourceImage::new("x", b"two".to_vec());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn dimensions_unknown_until_computed() {
        let source = SourceImage::new("a", b"abc".to_vec());
        assert_eq!(source.known_dimensions(), None);

        let seeded = source.with_known_dimensions(Dimensions::new(10, 20));
        assert_eq!(seeded.known_dimensions(), Some(Dimensions::new(10, 20)));
    }

    #[test]
    fn from_path_uses_file_name() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sunset.jpg");
        std::fs::write(&path, b"bytes").unwrap();

        let source = SourceImage::from_path(&path).unwrap();
        assert_eq!(source.id(), "sunset.jpg");
        assert_eq!(source.bytes(), b"bytes");
    }

    // =========================================================================
    // collect_sources
    // =========================================================================

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"bytes").unwrap();
    }

    fn ids(files: &[SourceFile]) -> Vec<&str> {
        files.iter().map(|f| f.id.as_str()).collect()
    }

    #[test]
    fn same_stem_files_get_distinct_ids() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "dawn.jpg");
        touch(tmp.path(), "dawn.png");
        touch(tmp.path(), "a/dawn.jpg");
        touch(tmp.path(), "b/dawn.jpg");
        touch(tmp.path(), "notes.txt");

        let files = collect_sources(&[tmp.path().to_path_buf()], None);
        assert_eq!(ids(&files), vec!["a/dawn.jpg", "b/dawn.jpg", "dawn.jpg", "dawn.png"]);
    }

    #[test]
    fn single_file_input_is_named_by_file_name() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "trip/dawn.jpg");

        let files = collect_sources(&[tmp.path().join("trip/dawn.jpg")], None);
        assert_eq!(ids(&files), vec!["dawn.jpg"]);
        assert_eq!(files[0].path, tmp.path().join("trip/dawn.jpg"));
    }

    #[test]
    fn excluded_store_is_not_walked() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "dawn.jpg");
        touch(tmp.path(), "variants/dawn.jpg/thumbnail.webp");

        let all = collect_sources(&[tmp.path().to_path_buf()], None);
        assert_eq!(all.len(), 2);

        let store = tmp.path().join("variants");
        let files = collect_sources(&[tmp.path().to_path_buf()], Some(store.as_path()));
        assert_eq!(ids(&files), vec!["dawn.jpg"]);
    }

    #[test]
    fn from_file_keeps_collected_id() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a/dawn.jpg");
        let files = collect_sources(&[tmp.path().to_path_buf()], None);

        let source = SourceImage::from_file(&files[0]).unwrap();
        assert_eq!(source.id(), "a/dawn.jpg");
    }

    #[test]
    fn debug_omits_bytes() {
        let source = SourceImage::new("a", vec![0u8; 1024]);
        let debug = format!("{source:?}");
        assert!(debug.contains("byte_size: 1024"));
        assert!(!debug.contains("0, 0, 0"));
    }
}
