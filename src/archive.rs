//! Archive engine
//!
//! This module provides [`Archive`], the only component that mutates both
//! the archived tree and its [`IndexStore`].
//!
//! ## Overview
//!
//! Every mutating operation runs the same stages:
//!
//! 1. **Validate**: all preconditions are checked before anything changes,
//!    so a failed check leaves no trace.
//! 2. **Mutate the filesystem**: the affected directories are switched to
//!    the read-write mode for the duration of the change and back to the
//!    read-only mode afterwards.
//! 3. **Mutate the index**: records are inserted, updated in place or
//!    removed.
//!
//! Changes reach disk with [`Archive::commit`], which flushes the index and
//! regenerates the integrity sidecar. Nothing rolls back automatically: a
//! crash between stages 2 and 3 leaves the two sides divergent, which
//! [`Archive::check`] reports.
//!
//! ## Paths
//!
//! Archive paths may be absolute or relative to the working directory. The
//! parent of a path is resolved, the final component never is, so symlinks
//! inside the archive are addressed as themselves. Paths under the metadata
//! directory are refused.
//!
//! ## Concurrency
//!
//! One process, one writer. Two `Archive` values over the same root will
//! overwrite each other's index; the permission toggling does not serialize
//! access between processes.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use archman::{Archive, ArchiveConfig};
//! use std::path::Path;
//!
//! # fn main() -> archman::Result<()> {
//! let mut archive = Archive::create(Path::new("/data/photos"), ArchiveConfig::default())?;
//! archive.add_dir(Path::new("/home/me/2024"), Path::new("/data/photos/2024"))?;
//! archive.commit()?;
//!
//! archive.check()?;
//! # Ok(())
//! # }
//! ```

use crate::backend::{self, ArchiveBackend};
use crate::check::{self, ConsistencyChecker};
use crate::error::{ArchiveError, Result};
use crate::guard::IntegrityGuard;
use crate::index::{FileFilter, FolderFilter, IndexStore};
use crate::types::*;
use crate::utils::{self, PermissionGuard};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Index-backed archive
///
/// # Examples
///
/// ```rust,no_run
/// use archman::ArchiveBuilder;
/// use std::path::Path;
///
/// # fn main() -> archman::Result<()> {
/// let archive = ArchiveBuilder::new()
///     .duplicate_suffix(".copy")
///     .locate(Path::new("/data/photos/2024/img.jpg"))?;
/// let listing = archive.list(archive.root(), false)?;
/// println!("{:?}", listing.paths());
/// # Ok(())
/// # }
/// ```
pub struct Archive {
    /// Canonical archive root
    root: PathBuf,
    /// Configuration
    config: ArchiveConfig,
    /// Source of truth for tracked entries
    index: IndexStore,
    /// Sidecar digest of the index file
    guard: IntegrityGuard,
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("folders", &self.index.folder_count())
            .field("files", &self.index.file_count())
            .field("pending_changes", &self.index.has_pending_changes())
            .finish()
    }
}

/// Entry of a source tree scanned before `add_dir` copies it
struct SourceEntry {
    rel: PathBuf,
    name: String,
    mode: u32,
    /// `None` for directories
    digest: Option<ContentDigest>,
}

fn parent_of(rel: &Path) -> &Path {
    rel.parent().unwrap_or_else(|| Path::new(""))
}

impl Archive {
    /// Create a new, empty archive at `root`
    ///
    /// `root` must not exist; its parent must. The root directory and the
    /// metadata directory are created, the index is initialized with a
    /// single root record and the integrity sidecar is written. The root is
    /// left in the read-only mode. If any step after creating the root
    /// fails, the root is removed again.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::AlreadyExists`] if `root` exists
    /// - [`ArchiveError::NotFound`] if the parent of `root` is missing
    #[instrument(skip(config))]
    pub fn create(root: &Path, config: ArchiveConfig) -> Result<Self> {
        info!("Creating archive at {:?}", root);

        let root = utils::absolute_entry_path(root)?;
        utils::require_absent(&root)?;

        fs::create_dir(&root)?;
        match Self::initialize(&root, &config) {
            Ok((index, guard)) => Ok(Self {
                root,
                config,
                index,
                guard,
            }),
            Err(e) => {
                warn!("Creating archive at {:?} failed, removing it: {}", root, e);
                if let Err(cleanup) = utils::remove_tree_forced(&root, config.dir_read_write_mode) {
                    warn!("Could not remove partial archive {:?}: {}", root, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Lay out the metadata directory, index and sidecar under a fresh root
    fn initialize(root: &Path, config: &ArchiveConfig) -> Result<(IndexStore, IntegrityGuard)> {
        utils::set_permissions(root, config.dir_read_write_mode)?;
        let index_dir = root.join(&config.index_dir_name);
        fs::create_dir(&index_dir)?;
        utils::set_permissions(&index_dir, config.dir_read_write_mode)?;
        utils::set_permissions(root, config.dir_read_only_mode)?;

        let index_path = index_dir.join(&config.index_file_name);
        let index = IndexStore::open(&index_path, root, true)?;
        let guard = IntegrityGuard::new(index_dir.join(&config.sidecar_file_name), &index_path);
        guard.initialize()?;
        Ok((index, guard))
    }

    /// Open the archive whose root is `root`
    ///
    /// The index file is verified against its sidecar before it is loaded.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::NotFound`] if the root, the metadata directory, the
    ///   index or the sidecar is missing
    /// - [`ArchiveError::IndexCorrupted`] if the index fails verification
    #[instrument(skip(config))]
    pub fn open(root: &Path, config: ArchiveConfig) -> Result<Self> {
        let root = fs::canonicalize(root).map_err(|_| ArchiveError::NotFound(root.to_path_buf()))?;
        let index_dir = root.join(&config.index_dir_name);
        utils::require_dir(&index_dir)?;

        let index_path = index_dir.join(&config.index_file_name);
        let guard = IntegrityGuard::new(index_dir.join(&config.sidecar_file_name), &index_path);
        guard.verify()?;
        let index = IndexStore::open(&index_path, &root, false)?;

        debug!(
            "Opened archive {:?}: {} folders, {} files",
            root,
            index.folder_count(),
            index.file_count()
        );
        Ok(Self {
            root,
            config,
            index,
            guard,
        })
    }

    /// Root of the archive containing `path`
    ///
    /// Components of `path` are tried from the filesystem root downwards;
    /// the first (outermost) directory holding the metadata directory wins.
    /// `path` itself need not exist.
    pub fn locate_root(path: &Path, config: &ArchiveConfig) -> Result<PathBuf> {
        utils::locate_marked_ancestor(path, &config.index_dir_name, utils::MarkerKind::Directory)?
            .ok_or_else(|| ArchiveError::NotInArchive(path.to_path_buf()))
    }

    /// Open the archive containing `path`
    pub fn locate(path: &Path, config: ArchiveConfig) -> Result<Self> {
        let root = Self::locate_root(path, &config)?;
        Self::open(&root, config)
    }

    /// Canonical archive root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active configuration
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Read access to the index
    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Absolute and root-relative form of an archive path
    fn resolve(&self, path: &Path) -> Result<(PathBuf, PathBuf)> {
        let abs = utils::absolute_entry_path(path)?;
        let rel = match abs.strip_prefix(&self.root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => return Err(ArchiveError::NotInArchive(abs)),
        };
        if rel.starts_with(&self.config.index_dir_name) {
            return Err(ArchiveError::NotInArchive(abs));
        }
        Ok((abs, rel))
    }

    /// Destination outside the archive that does not exist yet
    fn export_target(&self, dst: &Path) -> Result<PathBuf> {
        let dst = utils::absolute_entry_path(dst)?;
        utils::require_absent(&dst)?;
        if dst.starts_with(&self.root) {
            return Err(ArchiveError::invariant(format!(
                "export destination {:?} lies inside the archive",
                dst
            )));
        }
        Ok(dst)
    }

    fn tracked_folder(&self, rel: &Path) -> Result<Uid> {
        let (uid, _) = self.index.folder_from_path(rel)?;
        Ok(uid)
    }

    /// Reject `rel` if the index already has a record under that name
    fn ensure_untracked(&self, rel: &Path) -> Result<()> {
        if self.index.file_from_path(rel).is_ok() || self.index.folder_from_path(rel).is_ok() {
            return Err(ArchiveError::AlreadyExists(self.root.join(rel)));
        }
        Ok(())
    }

    /// Hold the archive directory `rel` writable
    fn unlock(&self, rel: &Path) -> Result<PermissionGuard> {
        PermissionGuard::relax(
            &self.root.join(rel),
            self.config.dir_read_write_mode,
            self.config.dir_read_only_mode,
        )
    }

    /// List the folder at `path`
    ///
    /// Entries come from the index, name-sorted, folders and files apart.
    /// Without `recursive`, sub folders are listed with empty contents.
    pub fn list(&self, path: &Path, recursive: bool) -> Result<Listing> {
        let (abs, rel) = self.resolve(path)?;
        let uid = match self.index.folder_from_path(&rel) {
            Ok((uid, _)) => uid,
            Err(_) if self.index.file_from_path(&rel).is_ok() => {
                return Err(ArchiveError::NotADirectory(abs));
            }
            Err(e) => return Err(e),
        };

        let mut listing = self.listing(uid, recursive);
        listing.sort();
        Ok(listing)
    }

    fn listing(&self, uid: Uid, recursive: bool) -> Listing {
        let folders = self
            .index
            .folders(&FolderFilter::children_of(uid))
            .into_iter()
            .map(|(child, folder)| FolderListing {
                name: folder.name,
                mode: folder.mode,
                contents: if recursive {
                    self.listing(child, true)
                } else {
                    Listing::default()
                },
            })
            .collect();
        let files = self
            .index
            .files(&FileFilter::children_of(uid))
            .into_iter()
            .map(|(_, file)| FileListing {
                name: file.name,
                mode: file.mode,
                digest: Some(file.digest),
            })
            .collect();
        Listing { folders, files }
    }

    /// Copy the file or symlink `src` into the archive at `dst`
    ///
    /// # Errors
    ///
    /// In order of checking:
    /// - [`ArchiveError::NotFound`] if `src` is missing
    /// - [`ArchiveError::NotAFile`] if `src` is a directory
    /// - [`ArchiveError::AlreadyExists`] if `dst` exists
    /// - [`ArchiveError::NotFound`] if the parent of `dst` is not tracked
    #[instrument(skip(self))]
    pub fn add_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src = utils::absolute_entry_path(src)?;
        utils::require_file(&src)?;
        let (dst, rel) = self.resolve(dst)?;
        utils::require_absent(&dst)?;
        let parent_uid = self.tracked_folder(parent_of(&rel))?;
        self.ensure_untracked(&rel)?;

        let name = utils::entry_name(&rel)?.to_string();
        let digest = utils::digest_entry(&src)?;
        let mode = utils::entry_mode(&src)?;

        info!("Adding file {:?} as {:?}", src, dst);
        let guard = self.unlock(parent_of(&rel))?;
        utils::copy_entry(&src, &dst)?;
        guard.finish()?;

        self.index.add_file(FileRecord {
            parent_uid,
            name,
            digest,
            mode,
        })?;
        Ok(())
    }

    /// Copy the directory tree `src` into the archive at `dst`
    ///
    /// Symlinks are copied as links. Every copied directory is left in the
    /// read-only mode; records keep the source modes.
    #[instrument(skip(self))]
    pub fn add_dir(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src = utils::absolute_entry_path(src)?;
        utils::require_dir(&src)?;
        let (dst, rel) = self.resolve(dst)?;
        utils::require_absent(&dst)?;
        let parent_uid = self.tracked_folder(parent_of(&rel))?;
        self.ensure_untracked(&rel)?;

        if dst.starts_with(fs::canonicalize(&src)?) {
            return Err(ArchiveError::invariant(format!(
                "cannot add {:?} inside itself at {:?}",
                src, dst
            )));
        }

        let name = utils::entry_name(&rel)?.to_string();
        let mode = utils::entry_mode(&src)?;
        let entries = scan_source_tree(&src)?;

        info!("Adding directory {:?} as {:?} ({} entries)", src, dst, entries.len());
        let guard = self.unlock(parent_of(&rel))?;
        utils::copy_tree(&src, &dst, Some(self.config.dir_read_only_mode))?;
        guard.finish()?;

        let top = self.index.add_folder(FolderRecord {
            parent_uid: Some(parent_uid),
            name,
            mode,
        })?;

        let mut folders: HashMap<PathBuf, Uid> = HashMap::new();
        folders.insert(PathBuf::new(), top);
        for entry in entries {
            let parent_uid = *folders.get(parent_of(&entry.rel)).ok_or_else(|| {
                ArchiveError::invariant(format!("no folder record for parent of {:?}", entry.rel))
            })?;
            match entry.digest {
                None => {
                    let uid = self.index.add_folder(FolderRecord {
                        parent_uid: Some(parent_uid),
                        name: entry.name,
                        mode: entry.mode,
                    })?;
                    folders.insert(entry.rel, uid);
                }
                Some(digest) => {
                    self.index.add_file(FileRecord {
                        parent_uid,
                        name: entry.name,
                        digest,
                        mode: entry.mode,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Remove the tracked file or symlink `dst`
    #[instrument(skip(self))]
    pub fn delete_file(&mut self, dst: &Path) -> Result<()> {
        let (dst, rel) = self.resolve(dst)?;
        utils::require_file(&dst)?;
        let (uid, _) = self.index.file_from_path(&rel)?;

        info!("Deleting file {:?}", dst);
        let guard = self.unlock(parent_of(&rel))?;
        fs::remove_file(&dst)?;
        guard.finish()?;

        self.index.delete_file(uid)
    }

    /// Remove the tracked directory `dst` and everything below it
    #[instrument(skip(self))]
    pub fn delete_dir(&mut self, dst: &Path) -> Result<()> {
        let (dst, rel) = self.resolve(dst)?;
        utils::require_dir(&dst)?;
        if rel.as_os_str().is_empty() {
            return Err(ArchiveError::invariant("the archive root cannot be deleted"));
        }
        let (uid, _) = self.index.folder_from_path(&rel)?;

        info!("Deleting directory {:?}", dst);
        let guard = self.unlock(parent_of(&rel))?;
        utils::remove_tree_forced(&dst, self.config.dir_read_write_mode)?;
        guard.finish()?;

        self.index.delete_folder(uid)
    }

    /// Replace the content of the tracked file `dst` with that of `src`
    ///
    /// The record keeps its identifier and location; digest and mode are
    /// taken from `src`.
    ///
    /// # Errors
    ///
    /// In order of checking:
    /// - [`ArchiveError::NotFound`] / [`ArchiveError::NotAFile`] if `dst` is
    ///   missing, not a file or not tracked
    /// - [`ArchiveError::NotFound`] / [`ArchiveError::NotAFile`] for `src`
    #[instrument(skip(self))]
    pub fn update_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let (dst, rel) = self.resolve(dst)?;
        utils::require_file(&dst)?;
        let (uid, record) = self.index.file_from_path(&rel)?;
        let src = utils::absolute_entry_path(src)?;
        utils::require_file(&src)?;
        if src == dst {
            return Err(ArchiveError::invariant(format!("cannot update {:?} with itself", dst)));
        }

        let digest = utils::digest_entry(&src)?;
        let mode = utils::entry_mode(&src)?;

        info!("Updating {:?} with {:?}", dst, src);
        let guard = self.unlock(parent_of(&rel))?;
        fs::remove_file(&dst)?;
        utils::copy_entry(&src, &dst)?;
        guard.finish()?;

        self.index.update_file(
            uid,
            FileRecord {
                digest,
                mode,
                ..record
            },
        )
    }

    /// Move the tracked file `src` to `dst` within the archive
    ///
    /// The digest at the new location must equal the recorded one; a
    /// mismatch is an [`ArchiveError::InvariantViolation`] and leaves the
    /// record untouched.
    #[instrument(skip(self))]
    pub fn move_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let (dst, dst_rel) = self.resolve(dst)?;
        utils::require_absent(&dst)?;
        let (src, src_rel) = self.resolve(src)?;
        utils::require_file(&src)?;
        let (uid, record) = self.index.file_from_path(&src_rel)?;
        let parent_uid = self.tracked_folder(parent_of(&dst_rel))?;
        self.ensure_untracked(&dst_rel)?;
        let name = utils::entry_name(&dst_rel)?.to_string();

        info!("Moving file {:?} to {:?}", src, dst);
        let dst_guard = self.unlock(parent_of(&dst_rel))?;
        let src_guard = if parent_of(&src_rel) != parent_of(&dst_rel) {
            Some(self.unlock(parent_of(&src_rel))?)
        } else {
            None
        };
        fs::rename(&src, &dst)?;
        if let Some(guard) = src_guard {
            guard.finish()?;
        }
        dst_guard.finish()?;

        let digest = utils::digest_entry(&dst)?;
        if digest != record.digest {
            return Err(ArchiveError::invariant(format!(
                "digest of {:?} changed during move: {} != {}",
                dst,
                digest.short(),
                record.digest.short()
            )));
        }

        self.index.update_file(
            uid,
            FileRecord {
                parent_uid,
                name,
                ..record
            },
        )
    }

    /// Move the tracked directory `src` to `dst` within the archive
    #[instrument(skip(self))]
    pub fn move_dir(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let (dst, dst_rel) = self.resolve(dst)?;
        utils::require_absent(&dst)?;
        let (src, src_rel) = self.resolve(src)?;
        utils::require_dir(&src)?;
        if src_rel.as_os_str().is_empty() {
            return Err(ArchiveError::invariant("the archive root cannot be moved"));
        }
        let (uid, record) = self.index.folder_from_path(&src_rel)?;
        let parent_uid = self.tracked_folder(parent_of(&dst_rel))?;
        self.ensure_untracked(&dst_rel)?;
        if dst_rel.starts_with(&src_rel) {
            return Err(ArchiveError::invariant(format!(
                "cannot move {:?} inside itself at {:?}",
                src, dst
            )));
        }
        let name = utils::entry_name(&dst_rel)?.to_string();

        info!("Moving directory {:?} to {:?}", src, dst);
        let dst_guard = self.unlock(parent_of(&dst_rel))?;
        let src_guard = if parent_of(&src_rel) != parent_of(&dst_rel) {
            Some(self.unlock(parent_of(&src_rel))?)
        } else {
            None
        };
        // renaming a directory across parents rewrites its ".." entry
        let mut moved_guard = self.unlock(&src_rel)?;
        fs::rename(&src, &dst)?;
        moved_guard.relocate(&dst);
        moved_guard.finish()?;
        if let Some(guard) = src_guard {
            guard.finish()?;
        }
        dst_guard.finish()?;

        self.index.update_folder(
            uid,
            FolderRecord {
                parent_uid: Some(parent_uid),
                name,
                ..record
            },
        )
    }

    /// Copy the tracked file `src` out of the archive to `dst`
    ///
    /// The copy is verified against the recorded digest. On mismatch the
    /// archive side is verified: if it is corrupt the error is
    /// [`ArchiveError::IntegrityMismatch`], otherwise the copy is retried
    /// once and a second mismatch is [`ArchiveError::UnreliableCopy`].
    #[instrument(skip(self))]
    pub fn export_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let dst = self.export_target(dst)?;
        let (src, rel) = self.resolve(src)?;
        utils::require_file(&src)?;
        let (_, record) = self.index.file_from_path(&rel)?;

        info!("Exporting file {:?} to {:?}", src, dst);
        utils::copy_entry(&src, &dst)?;
        self.verify_export(&src, &dst, &record)
    }

    /// Copy the tracked directory `src` out of the archive to `dst`
    ///
    /// Only tracked entries are exported. Exported directories get their
    /// recorded modes once all their content is in place.
    #[instrument(skip(self))]
    pub fn export_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        let dst = self.export_target(dst)?;
        let (src, rel) = self.resolve(src)?;
        utils::require_dir(&src)?;
        let (uid, record) = self.index.folder_from_path(&rel)?;

        info!("Exporting directory {:?} to {:?}", src, dst);
        fs::create_dir(&dst)?;

        let mut dirs: HashMap<Uid, (PathBuf, PathBuf)> = HashMap::new();
        dirs.insert(uid, (src, dst.clone()));
        let mut modes = vec![(dst, record.mode)];
        let mut exported = 0usize;

        for entry in self.index.walk_from(uid) {
            let (from_dir, to_dir) = dirs
                .get(&entry.folder_uid)
                .cloned()
                .ok_or_else(|| ArchiveError::invariant(format!("folder {} visited early", entry.folder_uid)))?;

            for (_, file) in &entry.files {
                let from = from_dir.join(&file.name);
                let to = to_dir.join(&file.name);
                utils::copy_entry(&from, &to)?;
                self.verify_export(&from, &to, file)?;
                exported += 1;
            }
            for (child, folder) in &entry.folders {
                let from = from_dir.join(&folder.name);
                let to = to_dir.join(&folder.name);
                fs::create_dir(&to)?;
                modes.push((to.clone(), folder.mode));
                dirs.insert(*child, (from, to));
            }
        }

        // deepest first, so read-only modes never block a child
        for (path, mode) in modes.iter().rev() {
            utils::set_permissions(path, *mode)?;
        }

        debug!("Exported {} files in {} folders", exported, modes.len());
        Ok(())
    }

    fn verify_export(&self, src: &Path, dst: &Path, record: &FileRecord) -> Result<()> {
        self.verify_export_with(src, dst, record, utils::copy_entry)
    }

    /// Verify an exported copy, re-copying once with `copy` on mismatch
    fn verify_export_with(
        &self,
        src: &Path,
        dst: &Path,
        record: &FileRecord,
        copy: impl Fn(&Path, &Path) -> Result<()>,
    ) -> Result<()> {
        if check::verify_file(dst, record).is_ok() {
            return Ok(());
        }

        warn!("Digest mismatch between index and exported {:?}, checking the archive copy", dst);
        check::verify_file(src, record)?;

        warn!("Archive copy of {:?} is intact, copying again", src);
        if utils::entry_exists(dst) {
            fs::remove_file(dst)?;
        }
        copy(src, dst)?;
        check::verify_file(dst, record).map_err(|_| ArchiveError::UnreliableCopy(dst.to_path_buf()))
    }

    /// Collapse files with identical content below the tracked directory `dir`
    ///
    /// With `hardlink`, each disposable path is replaced by a hard link to
    /// the kept one and the index is left as is. Without it, disposable
    /// paths are deleted from the archive and the index.
    #[instrument(skip(self))]
    pub fn dedup(&mut self, dir: &Path, hardlink: bool) -> Result<DedupReport> {
        let (dir, rel) = self.resolve(dir)?;
        utils::require_dir(&dir)?;
        self.tracked_folder(&rel)?;

        let metadata_dir = self.root.join(&self.config.index_dir_name);
        let scan = utils::find_duplicates(&dir, &self.config.duplicate_suffix, Some(&metadata_dir))?;
        info!(
            "Dedup of {:?}: {} files, {} duplicates",
            dir,
            scan.files_scanned,
            scan.pairs.len()
        );

        for (keep, dispose) in &scan.pairs {
            info!("Duplicate content: keeping {:?}, disposing of {:?}", keep, dispose);
            if hardlink {
                let (_, dispose_rel) = self.resolve(dispose)?;
                let guard = self.unlock(parent_of(&dispose_rel))?;
                fs::remove_file(dispose)?;
                fs::hard_link(keep, dispose)?;
                guard.finish()?;
            } else {
                self.delete_file(dispose)?;
            }
        }

        Ok(DedupReport {
            files_scanned: scan.files_scanned,
            pairs: scan.pairs,
            hardlinked: hardlink,
        })
    }

    /// Audit the archive against its index; see [`ConsistencyChecker`]
    #[instrument(skip(self))]
    pub fn check(&self) -> Result<CheckStats> {
        ConsistencyChecker::new(&self.index, &self.config.index_dir_name).run()
    }

    /// Flush the index and regenerate the integrity sidecar
    #[instrument(skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.index.commit()?;
        let digest = self.guard.refresh()?;
        info!("Committed archive {:?} (index {})", self.root, digest.short());
        Ok(())
    }
}

/// Walk `src` top-down, recording what `add_dir` will insert
fn scan_source_tree(src: &Path) -> Result<Vec<SourceEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(src).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(src)
            .map_err(|_| ArchiveError::invariant(format!("{:?} escaped {:?}", path, src)))?
            .to_path_buf();
        let file_type = entry.file_type();

        let digest = if file_type.is_dir() {
            None
        } else if file_type.is_file() || file_type.is_symlink() {
            Some(utils::digest_entry(path)?)
        } else {
            return Err(ArchiveError::NotAFile(path.to_path_buf()));
        };

        entries.push(SourceEntry {
            name: utils::entry_name(path)?.to_string(),
            mode: utils::entry_mode(path)?,
            rel,
            digest,
        });
    }

    Ok(entries)
}

/// Builder for archives with custom configuration
///
/// # Examples
///
/// ```rust,no_run
/// use archman::{ArchiveBuilder, ArchiveKind};
/// use std::path::Path;
///
/// # fn main() -> archman::Result<()> {
/// let archive = ArchiveBuilder::new()
///     .read_only_mode(0o500)
///     .read_write_mode(0o700)
///     .create(Path::new("/data/private"))?;
///
/// let reference = ArchiveBuilder::new()
///     .kind(ArchiveKind::Reference)
///     .create_backend(Path::new("/data/scratch"))?;
/// # Ok(())
/// # }
/// ```
///
/// # Default Values
///
/// See [`ArchiveConfig::default`]: `0o555` / `0o755`, metadata in
/// `.archman`, duplicate suffix `.dup`, indexed backend.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    config: ArchiveConfig,
}

impl ArchiveBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ArchiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Mode of archive directories outside of a mutation
    pub fn read_only_mode(mut self, mode: u32) -> Self {
        self.config.dir_read_only_mode = mode;
        self
    }

    /// Mode of archive directories during a mutation
    ///
    /// Must include owner write and search permission.
    pub fn read_write_mode(mut self, mode: u32) -> Self {
        self.config.dir_read_write_mode = mode;
        self
    }

    /// Name of the metadata directory at the archive root
    pub fn index_dir_name(mut self, name: impl Into<String>) -> Self {
        self.config.index_dir_name = name.into();
        self
    }

    /// Suffix that marks the disposable side of a duplicate pair
    pub fn duplicate_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.duplicate_suffix = suffix.into();
        self
    }

    /// Backend used by [`create_backend`](Self::create_backend) and
    /// [`locate_backend`](Self::locate_backend)
    pub fn kind(mut self, kind: ArchiveKind) -> Self {
        self.config.kind = kind;
        self
    }

    /// Create an index-backed archive at `root`
    pub fn create(self, root: &Path) -> Result<Archive> {
        Archive::create(root, self.config)
    }

    /// Open the index-backed archive at `root`
    pub fn open(self, root: &Path) -> Result<Archive> {
        Archive::open(root, self.config)
    }

    /// Open the index-backed archive containing `path`
    pub fn locate(self, path: &Path) -> Result<Archive> {
        Archive::locate(path, self.config)
    }

    /// Create an archive of the configured kind at `root`
    pub fn create_backend(self, root: &Path) -> Result<Box<dyn ArchiveBackend>> {
        backend::create_archive(root, self.config)
    }

    /// Open the archive of the configured kind containing `path`
    pub fn locate_backend(self, path: &Path) -> Result<Box<dyn ArchiveBackend>> {
        backend::open_archive(path, self.config)
    }
}
