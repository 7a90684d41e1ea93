//! # archman - Write-protected file archives with integrity tracking
//!
//! A library for keeping a directory tree as an archive: the tree lives on
//! disk as ordinary files, read-only outside of controlled mutations, and a
//! persistent index records what every file should contain.
//!
//! ## Overview
//!
//! archman lets you:
//! - Create an archive and add files or whole directory trees to it
//! - Delete, move, rename and update archived entries
//! - Export files or trees back out, verified against the index
//! - Collapse duplicate content into hard links or remove it
//! - Detect bit rot, interrupted operations and manual tampering
//!
//! ## Architecture
//!
//! - **Index Store** ([`IndexStore`]): folder and file records keyed by
//!   stable identifiers, persisted as one `bincode` file
//! - **Integrity Guard** ([`IntegrityGuard`]): SHA-256 sidecar of the index
//!   file, verified on open and rewritten on commit
//! - **Archive Engine** ([`Archive`]): every mutation, keeping the tree and
//!   the index in step and the directories write-protected
//! - **Consistency Checker** ([`ConsistencyChecker`]): read-only audit of
//!   the tree against the index
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archman::{Archive, ArchiveConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let root = Path::new("./photos");
//! let mut archive = Archive::create(root, ArchiveConfig::default())?;
//!
//! archive.add_dir(Path::new("./camera/2024"), &root.join("2024"))?;
//! archive.commit()?;
//!
//! // later, from anywhere inside the archive
//! let archive = Archive::locate(&root.join("2024"), ArchiveConfig::default())?;
//! let stats = archive.check()?;
//! println!("{} folders, {} files intact", stats.folders, stats.files);
//!
//! archive.export_file(&root.join("2024/beach.jpg"), Path::new("./beach.jpg"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! [`ArchiveBackend`] abstracts the operations above. [`Archive`] is the
//! index-backed implementation; [`ReferenceArchive`] applies the same
//! operations straight to the filesystem and serves as a behavioural
//! baseline. [`ArchiveConfig::kind`] picks one:
//!
//! ```rust,no_run
//! use archman::{ArchiveBuilder, ArchiveKind};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut backend = ArchiveBuilder::new()
//!     .kind(ArchiveKind::Reference)
//!     .create_backend(Path::new("./scratch"))?;
//! backend.add_file(Path::new("./notes.txt"), Path::new("./scratch/notes.txt"))?;
//! backend.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`](Result). [`ArchiveError::kind`] sorts
//! errors into the categories callers branch on, and
//! [`ArchiveError::user_message`] gives a one-line description.
//!
//! ## Concurrency
//!
//! Everything is synchronous and single-threaded. There is no locking:
//! two engines working on the same archive at once can leave the index and
//! the tree out of step. The same holds for a process killed between the
//! filesystem half and the index half of an operation. [`Archive::check`]
//! finds such divergence but does not repair it.
//!
//! ## Module Organization
//!
//! - [`archive`]: the engine and [`ArchiveBuilder`]
//! - [`index`]: record storage, queries and persistence
//! - [`guard`]: index sidecar digest
//! - [`check`]: consistency audit
//! - [`backend`]: capability trait and backend selection
//! - [`reference`]: filesystem-only backend
//! - [`types`]: records, listings and configuration
//! - [`utils`]: digests, permissions, copying and path helpers
//! - [`error`]: error types

// Public API modules
pub mod archive;
pub mod backend;
pub mod check;
pub mod error;
pub mod guard;
pub mod index;
pub mod reference;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use archive::{Archive, ArchiveBuilder};
pub use backend::{create_archive, locate_archive_root, open_archive, ArchiveBackend};
pub use check::ConsistencyChecker;
pub use error::{ArchiveError, ConsistencyIssue, ErrorKind, Result};
pub use guard::IntegrityGuard;
pub use index::IndexStore;
pub use reference::ReferenceArchive;
pub use types::*;
