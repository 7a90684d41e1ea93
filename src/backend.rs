//! Archive capability interface
//!
//! [`ArchiveBackend`] is the surface the CLI works against. Two
//! implementations exist:
//!
//! - [`Archive`]: the index-backed engine
//! - [`ReferenceArchive`]: the filesystem is the only truth, used to
//!   compare observable behaviour
//!
//! [`ArchiveConfig::kind`] selects one in [`create_archive`] and
//! [`open_archive`].

use crate::archive::Archive;
use crate::error::Result;
use crate::reference::ReferenceArchive;
use crate::types::{ArchiveConfig, ArchiveKind, CheckStats, DedupReport, Listing};
use std::path::{Path, PathBuf};

/// Operations every archive implementation provides
pub trait ArchiveBackend: std::fmt::Debug {
    /// Archive root
    fn root(&self) -> &Path;

    /// Contents of the directory at `path`
    fn list(&self, path: &Path, recursive: bool) -> Result<Listing>;

    /// Copy a file or symlink into the archive
    fn add_file(&mut self, src: &Path, dst: &Path) -> Result<()>;

    /// Copy a directory tree into the archive
    fn add_dir(&mut self, src: &Path, dst: &Path) -> Result<()>;

    /// Remove a file from the archive
    fn delete_file(&mut self, dst: &Path) -> Result<()>;

    /// Remove a directory tree from the archive
    fn delete_dir(&mut self, dst: &Path) -> Result<()>;

    /// Replace the content of an archived file
    fn update_file(&mut self, src: &Path, dst: &Path) -> Result<()>;

    /// Move a file within the archive
    fn move_file(&mut self, src: &Path, dst: &Path) -> Result<()>;

    /// Move a directory within the archive
    fn move_dir(&mut self, src: &Path, dst: &Path) -> Result<()>;

    /// Copy a file out of the archive
    fn export_file(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Copy a directory tree out of the archive
    fn export_dir(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Collapse files with identical content
    fn dedup(&mut self, dir: &Path, hardlink: bool) -> Result<DedupReport>;

    /// Audit the archive
    fn check(&self) -> Result<CheckStats>;

    /// Make pending changes durable
    fn commit(&mut self) -> Result<()>;
}

impl ArchiveBackend for Archive {
    fn root(&self) -> &Path {
        Archive::root(self)
    }

    fn list(&self, path: &Path, recursive: bool) -> Result<Listing> {
        Archive::list(self, path, recursive)
    }

    fn add_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        Archive::add_file(self, src, dst)
    }

    fn add_dir(&mut self, src: &Path, dst: &Path) -> Result<()> {
        Archive::add_dir(self, src, dst)
    }

    fn delete_file(&mut self, dst: &Path) -> Result<()> {
        Archive::delete_file(self, dst)
    }

    fn delete_dir(&mut self, dst: &Path) -> Result<()> {
        Archive::delete_dir(self, dst)
    }

    fn update_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        Archive::update_file(self, src, dst)
    }

    fn move_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        Archive::move_file(self, src, dst)
    }

    fn move_dir(&mut self, src: &Path, dst: &Path) -> Result<()> {
        Archive::move_dir(self, src, dst)
    }

    fn export_file(&self, src: &Path, dst: &Path) -> Result<()> {
        Archive::export_file(self, src, dst)
    }

    fn export_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        Archive::export_dir(self, src, dst)
    }

    fn dedup(&mut self, dir: &Path, hardlink: bool) -> Result<DedupReport> {
        Archive::dedup(self, dir, hardlink)
    }

    fn check(&self) -> Result<CheckStats> {
        Archive::check(self)
    }

    fn commit(&mut self) -> Result<()> {
        Archive::commit(self)
    }
}

/// Create an archive of `config.kind` at `root`
pub fn create_archive(root: &Path, config: ArchiveConfig) -> Result<Box<dyn ArchiveBackend>> {
    Ok(match config.kind {
        ArchiveKind::Indexed => Box::new(Archive::create(root, config)?),
        ArchiveKind::Reference => Box::new(ReferenceArchive::create(root, config)?),
    })
}

/// Root of the archive of `config.kind` containing `path`
pub fn locate_archive_root(path: &Path, config: &ArchiveConfig) -> Result<PathBuf> {
    match config.kind {
        ArchiveKind::Indexed => Archive::locate_root(path, config),
        ArchiveKind::Reference => ReferenceArchive::locate_root(path),
    }
}

/// Open the archive of `config.kind` containing `path`
pub fn open_archive(path: &Path, config: ArchiveConfig) -> Result<Box<dyn ArchiveBackend>> {
    let root = locate_archive_root(path, &config)?;
    Ok(match config.kind {
        ArchiveKind::Indexed => Box::new(Archive::open(&root, config)?),
        ArchiveKind::Reference => Box::new(ReferenceArchive::open(&root, config)?),
    })
}
