//! Error types for archman
//!
//! Every fallible operation returns [`Result<T>`]. Variants carry the path or
//! digest values needed to act on the failure; [`ArchiveError::kind`] folds
//! them into the small taxonomy callers usually branch on.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in archman
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Category of filesystem/index divergence reported by the consistency check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyIssue {
    /// A file or symlink exists on disk without a matching file record
    UntrackedFile,
    /// A directory exists on disk without a matching folder record
    UntrackedDirectory,
    /// A file record has no entry on disk
    MissingFile,
    /// A folder record has no directory on disk
    MissingDirectory,
    /// An entry is neither a file, a directory nor a symlink
    UnsupportedEntry,
}

impl fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConsistencyIssue::UntrackedFile => "untracked file",
            ConsistencyIssue::UntrackedDirectory => "untracked directory",
            ConsistencyIssue::MissingFile => "missing file",
            ConsistencyIssue::MissingDirectory => "missing directory",
            ConsistencyIssue::UnsupportedEntry => "unsupported entry type",
        };
        f.write_str(text)
    }
}

/// Coarse error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing file, directory, parent or index artifact
    NotFound,
    /// Destination collision
    AlreadyExists,
    /// Expected a file, found something else
    NotAFile,
    /// Expected a directory, found something else
    NotADirectory,
    /// Digest mismatch for a single file or for the whole index
    Integrity,
    /// Filesystem and index disagree
    Consistency,
    /// Internal invariant broken (e.g. digest changed during a move)
    InvariantViolation,
    /// Underlying I/O failure
    Io,
    /// Malformed index or configuration data
    Format,
}

/// Main error type for all archive operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A path that was required to exist does not
    #[error("Not found: {0:?}")]
    NotFound(PathBuf),

    /// A destination that must be free is already taken
    #[error("Already exists: {0:?}")]
    AlreadyExists(PathBuf),

    /// Expected a regular file or symlink
    #[error("Not a file: {0:?}")]
    NotAFile(PathBuf),

    /// Expected a directory
    #[error("Not a directory: {0:?}")]
    NotADirectory(PathBuf),

    /// Path does not lie inside any archive
    #[error("{0:?} is not within an archive")]
    NotInArchive(PathBuf),

    /// Content digest of a file disagrees with its record
    #[error("Digest mismatch for {path:?} - expected: {expected}, actual: {actual}")]
    IntegrityMismatch {
        /// File whose digest was checked
        path: PathBuf,
        /// Digest stored in the index
        expected: String,
        /// Digest computed from the file
        actual: String,
    },

    /// The index file does not match its sidecar digest
    #[error("Index {index:?} is corrupted - expected digest: {expected}, actual: {actual}")]
    IndexCorrupted {
        /// Index file path
        index: PathBuf,
        /// Digest recorded in the sidecar
        expected: String,
        /// Digest of the current index bytes
        actual: String,
    },

    /// Export copy kept failing verification after one retry
    #[error("Copy to {0:?} is unreliable")]
    UnreliableCopy(PathBuf),

    /// Filesystem and index disagree
    #[error("Consistency error: {issue}: {path:?}")]
    Consistency {
        /// Divergence category
        issue: ConsistencyIssue,
        /// Offending path
        path: PathBuf,
    },

    /// Index or engine invariant broken
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Index file could not be understood
    #[error("Invalid index format: {0}")]
    IndexFormat(String),
}

impl From<bincode::error::DecodeError> for ArchiveError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ArchiveError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ArchiveError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ArchiveError::Bincode(err.to_string())
    }
}

impl ArchiveError {
    /// Create an invariant violation with a custom message
    pub fn invariant(msg: impl Into<String>) -> Self {
        ArchiveError::InvariantViolation(msg.into())
    }

    /// Create a consistency error
    pub fn consistency(issue: ConsistencyIssue, path: impl Into<PathBuf>) -> Self {
        ArchiveError::Consistency {
            issue,
            path: path.into(),
        }
    }

    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::NotFound(_) | ArchiveError::NotInArchive(_) => ErrorKind::NotFound,
            ArchiveError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ArchiveError::NotAFile(_) => ErrorKind::NotAFile,
            ArchiveError::NotADirectory(_) => ErrorKind::NotADirectory,
            ArchiveError::IntegrityMismatch { .. }
            | ArchiveError::IndexCorrupted { .. }
            | ArchiveError::UnreliableCopy(_) => ErrorKind::Integrity,
            ArchiveError::Consistency { .. } => ErrorKind::Consistency,
            ArchiveError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            ArchiveError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            ArchiveError::Io(_) | ArchiveError::WalkDir(_) => ErrorKind::Io,
            ArchiveError::Json(_) | ArchiveError::Bincode(_) | ArchiveError::IndexFormat(_) => {
                ErrorKind::Format
            }
        }
    }

    /// Check if this error indicates corrupted content or index
    pub fn is_integrity(&self) -> bool {
        self.kind() == ErrorKind::Integrity
    }

    /// Check if this error is a filesystem/index divergence
    pub fn is_consistency(&self) -> bool {
        self.kind() == ErrorKind::Consistency
    }

    /// Divergence category, if this is a consistency error
    pub fn consistency_issue(&self) -> Option<ConsistencyIssue> {
        match self {
            ArchiveError::Consistency { issue, .. } => Some(*issue),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ArchiveError::NotInArchive(path) => {
                format!("{:?} is not inside an archive. Create one with 'archman new <dir>'.", path)
            }
            ArchiveError::IndexCorrupted { index, .. } => {
                format!(
                    "The index {:?} does not match its recorded digest. \
                     Restore the index from a backup before running further operations.",
                    index
                )
            }
            ArchiveError::Consistency { issue, path } => {
                format!(
                    "{} at {:?}. The archive and its index disagree; repair by re-running \
                     the add or delete operation that was interrupted.",
                    issue, path
                )
            }
            ArchiveError::IntegrityMismatch { path, .. } => {
                format!("Content of {:?} no longer matches the archived digest (bit rot or tampering).", path)
            }
            _ => self.to_string(),
        }
    }
}
