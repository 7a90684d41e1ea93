//! Filesystem-only archive
//!
//! [`ReferenceArchive`] keeps no index. The archived tree is its own
//! truth: every operation checks its preconditions against the live
//! filesystem and then changes it directly. There is no bit-rot protection,
//! [`commit`](ReferenceArchive::commit) does nothing and directories keep
//! whatever modes they were copied with.
//!
//! It exists to pin down the observable behaviour of [`Archive`]: both
//! implement [`ArchiveBackend`], and comparison tests run the same script
//! against each and compare listings.
//!
//! The archive root is recognised by an empty marker file, [`MARKER_FILE`].
//!
//! [`Archive`]: crate::Archive

use crate::backend::ArchiveBackend;
use crate::error::{ArchiveError, Result};
use crate::types::{ArchiveConfig, CheckStats, DedupReport, FileListing, FolderListing, Listing};
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

/// Name of the file marking a reference archive root
pub const MARKER_FILE: &str = ".archman-ref";

/// Archive whose only state is the directory tree itself
#[derive(Debug)]
pub struct ReferenceArchive {
    root: PathBuf,
    config: ArchiveConfig,
}

impl ReferenceArchive {
    /// Create the root directory and its marker file
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::AlreadyExists`] if `root` exists
    /// - [`ArchiveError::NotFound`] if the parent of `root` is missing
    #[instrument(skip(config))]
    pub fn create(root: &Path, config: ArchiveConfig) -> Result<Self> {
        let root = utils::absolute_entry_path(root)?;
        utils::require_absent(&root)?;

        fs::create_dir(&root)?;
        fs::File::create(root.join(MARKER_FILE))?;
        info!("Created reference archive at {:?}", root);
        Ok(Self { root, config })
    }

    /// Open the reference archive at `root`
    pub fn open(root: &Path, config: ArchiveConfig) -> Result<Self> {
        let root = fs::canonicalize(root).map_err(|_| ArchiveError::NotFound(root.to_path_buf()))?;
        utils::require_file(&root.join(MARKER_FILE))?;
        Ok(Self { root, config })
    }

    /// Outermost ancestor of `path` holding the marker file
    pub fn locate_root(path: &Path) -> Result<PathBuf> {
        utils::locate_marked_ancestor(path, MARKER_FILE, utils::MarkerKind::File)?
            .ok_or_else(|| ArchiveError::NotInArchive(path.to_path_buf()))
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let abs = utils::absolute_entry_path(path)?;
        match abs.strip_prefix(&self.root) {
            Ok(rel) if rel == Path::new(MARKER_FILE) => Err(ArchiveError::NotInArchive(abs)),
            Ok(_) => Ok(abs),
            Err(_) => Err(ArchiveError::NotInArchive(abs)),
        }
    }

    fn marker(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    fn listing(&self, dir: &Path, recursive: bool) -> Result<Listing> {
        let mut listing = Listing::default();
        for child in fs::read_dir(dir)? {
            let child = child?;
            let path = child.path();
            if path == self.marker() {
                continue;
            }
            let name = child.file_name().to_string_lossy().into_owned();
            let mode = utils::entry_mode(&path)?;
            if child.file_type()?.is_dir() {
                listing.folders.push(FolderListing {
                    name,
                    mode,
                    contents: if recursive {
                        self.listing(&path, true)?
                    } else {
                        Listing::default()
                    },
                });
            } else {
                listing.files.push(FileListing {
                    name,
                    mode,
                    digest: None,
                });
            }
        }
        Ok(listing)
    }
}

impl ArchiveBackend for ReferenceArchive {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list(&self, path: &Path, recursive: bool) -> Result<Listing> {
        let dir = self.resolve(path)?;
        utils::require_dir(&dir)?;
        let mut listing = self.listing(&dir, recursive)?;
        listing.sort();
        Ok(listing)
    }

    fn add_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src = utils::absolute_entry_path(src)?;
        utils::require_file(&src)?;
        let dst = self.resolve(dst)?;
        utils::require_absent(&dst)?;

        debug!("Adding file {:?} as {:?}", src, dst);
        utils::copy_entry(&src, &dst)
    }

    fn add_dir(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src = utils::absolute_entry_path(src)?;
        utils::require_dir(&src)?;
        let dst = self.resolve(dst)?;
        utils::require_absent(&dst)?;
        if dst.starts_with(fs::canonicalize(&src)?) {
            return Err(ArchiveError::invariant(format!(
                "cannot add {:?} inside itself at {:?}",
                src, dst
            )));
        }

        debug!("Adding directory {:?} as {:?}", src, dst);
        utils::copy_tree(&src, &dst, None)
    }

    fn delete_file(&mut self, dst: &Path) -> Result<()> {
        let dst = self.resolve(dst)?;
        utils::require_file(&dst)?;
        fs::remove_file(&dst)?;
        Ok(())
    }

    fn delete_dir(&mut self, dst: &Path) -> Result<()> {
        let dst = self.resolve(dst)?;
        utils::require_dir(&dst)?;
        if dst == self.root {
            return Err(ArchiveError::invariant("the archive root cannot be deleted"));
        }
        utils::remove_tree_forced(&dst, self.config.dir_read_write_mode)
    }

    fn update_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let dst = self.resolve(dst)?;
        utils::require_file(&dst)?;
        let src = utils::absolute_entry_path(src)?;
        utils::require_file(&src)?;
        if src == dst {
            return Err(ArchiveError::invariant(format!("cannot update {:?} with itself", dst)));
        }

        fs::remove_file(&dst)?;
        utils::copy_entry(&src, &dst)
    }

    fn move_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let dst = self.resolve(dst)?;
        utils::require_absent(&dst)?;
        let src = self.resolve(src)?;
        utils::require_file(&src)?;
        fs::rename(&src, &dst)?;
        Ok(())
    }

    fn move_dir(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let dst = self.resolve(dst)?;
        utils::require_absent(&dst)?;
        let src = self.resolve(src)?;
        utils::require_dir(&src)?;
        if src == self.root {
            return Err(ArchiveError::invariant("the archive root cannot be moved"));
        }
        if dst.starts_with(&src) {
            return Err(ArchiveError::invariant(format!(
                "cannot move {:?} inside itself at {:?}",
                src, dst
            )));
        }
        fs::rename(&src, &dst)?;
        Ok(())
    }

    fn export_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let dst = utils::absolute_entry_path(dst)?;
        utils::require_absent(&dst)?;
        let src = self.resolve(src)?;
        utils::require_file(&src)?;
        utils::copy_entry(&src, &dst)
    }

    fn export_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        let dst = utils::absolute_entry_path(dst)?;
        utils::require_absent(&dst)?;
        let src = self.resolve(src)?;
        utils::require_dir(&src)?;
        if dst.starts_with(&src) {
            return Err(ArchiveError::invariant(format!(
                "cannot export {:?} inside itself at {:?}",
                src, dst
            )));
        }

        utils::copy_tree(&src, &dst, None)?;
        if src == self.root {
            let guard = utils::PermissionGuard::relax_preserving(&dst, self.config.dir_read_write_mode)?;
            fs::remove_file(dst.join(MARKER_FILE))?;
            guard.finish()?;
        }
        Ok(())
    }

    fn dedup(&mut self, dir: &Path, hardlink: bool) -> Result<DedupReport> {
        let dir = self.resolve(dir)?;
        utils::require_dir(&dir)?;

        let marker = self.marker();
        let scan = utils::find_duplicates(&dir, &self.config.duplicate_suffix, Some(&marker))?;
        for (keep, dispose) in &scan.pairs {
            debug!("Duplicate content: keeping {:?}, disposing of {:?}", keep, dispose);
            fs::remove_file(dispose)?;
            if hardlink {
                fs::hard_link(keep, dispose)?;
            }
        }

        Ok(DedupReport {
            files_scanned: scan.files_scanned,
            pairs: scan.pairs,
            hardlinked: hardlink,
        })
    }

    /// Counts what is on disk; there is nothing to compare it with
    fn check(&self) -> Result<CheckStats> {
        let mut stats = CheckStats::default();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                stats.folders += 1;
            } else if entry.path() != self.marker() {
                stats.files += 1;
            }
        }
        Ok(stats)
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}
