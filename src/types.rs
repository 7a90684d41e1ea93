//! Core data types used throughout archman
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Index records**: `Uid`, `FolderRecord`, `FileRecord`, `ContentDigest`
//! - **Operation results**: `Listing`, `DedupReport`, `CheckStats`
//! - **Configuration**: `ArchiveConfig`, `ArchiveKind`
//!
//! ## Examples
//!
//! ```rust
//! use archman::types::{ArchiveConfig, ArchiveKind};
//!
//! let config = ArchiveConfig {
//!     duplicate_suffix: ".copy".to_string(),
//!     ..Default::default()
//! };
//! assert_eq!(config.kind, ArchiveKind::Indexed);
//! assert_eq!(config.dir_read_only_mode, 0o555);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque surrogate identifier of an index record
///
/// Identifiers are allocated by the index store, never reused within one
/// index, and independent of filesystem paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// SHA-256 digest of a file's bytes, or of a symlink's target text
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest(pub [u8; 32]);

impl ContentDigest {
    /// Digest as a 64-character lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.short())
    }
}

/// Index entry for a tracked directory
///
/// Exactly one folder record has no parent: the archive root, whose name is
/// [`ROOT_FOLDER_NAME`](crate::index::ROOT_FOLDER_NAME).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    /// Containing folder, `None` only for the archive root
    pub parent_uid: Option<Uid>,
    /// Directory name within its parent
    pub name: String,
    /// Permission bits (`0o777` mask)
    pub mode: u32,
}

/// Index entry for a tracked file or symlink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Containing folder
    pub parent_uid: Uid,
    /// File name within its parent
    pub name: String,
    /// Content digest as of the last operation that wrote the file
    pub digest: ContentDigest,
    /// Permission bits (`0o777` mask)
    pub mode: u32,
}

/// A listed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileListing {
    /// File name
    pub name: String,
    /// Permission bits
    pub mode: u32,
    /// Stored digest, if the backend keeps one
    pub digest: Option<ContentDigest>,
}

/// A listed folder and, for recursive listings, its contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderListing {
    /// Folder name
    pub name: String,
    /// Permission bits
    pub mode: u32,
    /// Children; empty unless the listing was recursive
    pub contents: Listing,
}

/// Contents of one archive directory, name-sorted, folders and files apart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Listing {
    /// Sub folders
    pub folders: Vec<FolderListing>,
    /// Files and symlinks
    pub files: Vec<FileListing>,
}

impl Listing {
    /// Whether the directory has no visible children
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    /// Sort folders and files by name, recursively
    pub fn sort(&mut self) {
        self.folders.sort_by(|a, b| a.name.cmp(&b.name));
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        for folder in &mut self.folders {
            folder.contents.sort();
        }
    }

    /// Flatten to relative paths; folders end with `/`
    ///
    /// ```rust
    /// use archman::types::{FileListing, FolderListing, Listing};
    ///
    /// let listing = Listing {
    ///     folders: vec![FolderListing {
    ///         name: "d".to_string(),
    ///         mode: 0o755,
    ///         contents: Listing {
    ///             folders: vec![],
    ///             files: vec![FileListing { name: "f".to_string(), mode: 0o644, digest: None }],
    ///         },
    ///     }],
    ///     files: vec![],
    /// };
    /// assert_eq!(listing.paths(), vec!["d/".to_string(), "d/f".to_string()]);
    /// ```
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for folder in &self.folders {
            let path = format!("{}{}/", prefix, folder.name);
            out.push(path.clone());
            folder.contents.collect_paths(&path, out);
        }
        for file in &self.files {
            out.push(format!("{}{}", prefix, file.name));
        }
    }
}

/// Outcome of a dedup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    /// Number of regular files digested
    pub files_scanned: usize,
    /// `(kept, disposed)` pairs in the order they were resolved
    pub pairs: Vec<(PathBuf, PathBuf)>,
    /// Whether disposed paths were re-created as hard links
    pub hardlinked: bool,
}

impl DedupReport {
    /// Number of duplicates resolved
    pub fn duplicates(&self) -> usize {
        self.pairs.len()
    }
}

/// Totals from a consistency check that found no divergence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Folders visited, root included
    pub folders: usize,
    /// Files whose digest was verified
    pub files: usize,
}

/// Which archive implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    /// Index-backed engine (the default)
    #[default]
    Indexed,
    /// Filesystem-is-truth reference implementation
    Reference,
}

/// Configuration for an archive instance
///
/// Permission modes are applied to archive directories around every
/// filesystem mutation: `dir_read_write_mode` while the change runs,
/// `dir_read_only_mode` afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Mode of archive directories outside of a mutation
    pub dir_read_only_mode: u32,
    /// Mode of archive directories during a mutation
    pub dir_read_write_mode: u32,
    /// Reserved metadata directory at the archive root
    pub index_dir_name: String,
    /// Index store file inside the metadata directory
    pub index_file_name: String,
    /// Integrity sidecar inside the metadata directory
    pub sidecar_file_name: String,
    /// Name suffix marking a file as the disposable side of a duplicate pair
    pub duplicate_suffix: String,
    /// Backend selection
    pub kind: ArchiveKind,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir_read_only_mode: 0o555,
            dir_read_write_mode: 0o755,
            index_dir_name: ".archman".to_string(),
            index_file_name: "index.bin".to_string(),
            sidecar_file_name: "index.sha256".to_string(),
            duplicate_suffix: ".dup".to_string(),
            kind: ArchiveKind::Indexed,
        }
    }
}
