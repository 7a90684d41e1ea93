//! Utility functions for archman
//!
//! ## Categories of Utilities
//!
//! ### Content digests
//! - SHA-256 over in-memory bytes, streamed file content, or symlink targets
//!
//! ### Permissions
//! - Extracting and applying permission bits (cross-platform)
//! - [`PermissionGuard`], which holds a directory writable for the duration of
//!   a filesystem change and puts the read-only mode back afterwards
//!
//! ### Copy and removal
//! - Symlink-preserving copies of single entries and whole trees
//! - Forced removal of read-only trees
//! - Atomic file writing
//!
//! ### Paths and preconditions
//! - Absolute entry paths that resolve the parent but never the final
//!   component, so symlinks are addressed as themselves
//! - `require_*` checks mapping entry types onto archive errors
//! - Locating the outermost ancestor that holds a marker entry
//!
//! ### Duplicates
//! - [`find_duplicates`], the digest scan shared by every dedup backend
//!
//! All functions return `Result<T, ArchiveError>`.

use crate::error::{ArchiveError, Result};
use crate::types::ContentDigest;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

/// Hash arbitrary data using SHA-256
///
/// ```rust
/// use archman::utils::digest_bytes;
///
/// let a = digest_bytes(b"f0000");
/// assert_eq!(a, digest_bytes(b"f0000"));
/// assert_ne!(a, digest_bytes(b"f0001"));
/// ```
pub fn digest_bytes(data: &[u8]) -> ContentDigest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    ContentDigest(hasher.finalize().into())
}

/// Hash a file's content with SHA-256 using buffered reads
///
/// Follows symlinks; use [`digest_entry`] for archive entries.
pub fn digest_file(path: &Path) -> Result<ContentDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192]; // 8KB buffer

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ContentDigest(hasher.finalize().into()))
}

/// Content digest of an archive entry
///
/// A symbolic link is digested by its target text, never dereferenced.
/// Anything else is digested by its bytes.
pub fn digest_entry(path: &Path) -> Result<ContentDigest> {
    let metadata = fs::symlink_metadata(path)?;
    let digest = if metadata.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        digest_bytes(target.as_os_str().as_encoded_bytes())
    } else {
        digest_file(path)?
    };
    trace!("{}: {:?}", digest.short(), path);
    Ok(digest)
}

/// Permission bits of an entry without following symlinks
pub fn entry_mode(path: &Path) -> Result<u32> {
    let metadata = entry_metadata(path)?;
    Ok(get_permissions(&metadata))
}

#[cfg(unix)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(windows)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    let mut mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Set permissions on a file or directory
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Set permissions on a file or directory
///
/// Windows only knows the read-only attribute, derived from the owner write bit.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let is_readonly = (mode & 0o200) == 0;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(is_readonly);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Keeps a directory writable until dropped or finished
///
/// The restore mode is applied on [`PermissionGuard::finish`], or on drop
/// if the guard is abandoned by an early return.
#[derive(Debug)]
pub struct PermissionGuard {
    path: PathBuf,
    restore_mode: u32,
    done: bool,
}

impl PermissionGuard {
    /// Switch `path` to `writable_mode`, remembering `restore_mode`
    pub fn relax(path: &Path, writable_mode: u32, restore_mode: u32) -> Result<Self> {
        set_permissions(path, writable_mode)?;
        trace!("Relaxed {:?} to {:o}", path, writable_mode);
        Ok(Self {
            path: path.to_path_buf(),
            restore_mode,
            done: false,
        })
    }

    /// Relax `path` and restore whatever mode it has now
    pub fn relax_preserving(path: &Path, writable_mode: u32) -> Result<Self> {
        let current = entry_mode(path)?;
        Self::relax(path, writable_mode, current)
    }

    /// Follow the guarded directory after it was renamed to `path`
    pub fn relocate(&mut self, path: &Path) {
        self.path = path.to_path_buf();
    }

    /// Restore the remembered mode, reporting failure
    pub fn finish(mut self) -> Result<()> {
        self.done = true;
        set_permissions(&self.path, self.restore_mode)?;
        trace!("Restored {:?} to {:o}", self.path, self.restore_mode);
        Ok(())
    }
}

impl Drop for PermissionGuard {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = set_permissions(&self.path, self.restore_mode) {
                warn!("Failed to restore permissions on {:?}: {}", self.path, e);
            }
        }
    }
}

/// Copy a single file or symlink; symlinks are recreated, not followed
pub fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    if metadata.file_type().is_symlink() {
        let target = read_symlink(src)?;
        create_symlink(&target, dst)?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Recursively copy a directory tree, preserving symlinks
///
/// Each created directory gets `dir_mode` if given, else its source mode.
/// Modes are applied after the children are copied so that read-only
/// trees can still be reproduced.
pub fn copy_tree(src: &Path, dst: &Path, dir_mode: Option<u32>) -> Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    fs::create_dir(dst)?;

    let mut entries = fs::read_dir(src)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to, dir_mode)?;
        } else {
            copy_entry(&from, &to)?;
        }
    }

    set_permissions(dst, dir_mode.unwrap_or_else(|| get_permissions(&metadata)))?;
    Ok(())
}

/// Remove a directory tree whose directories may be read-only
///
/// Every directory below `path` (symlinks are not followed) is switched to
/// `dir_mode` first.
pub fn remove_tree_forced(path: &Path, dir_mode: u32) -> Result<()> {
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            set_permissions(entry.path(), dir_mode)?;
        }
    }
    fs::remove_dir_all(path)?;
    trace!("Removed tree {:?}", path);
    Ok(())
}

/// Write a file atomically
///
/// Content goes to a temporary file in the same directory, is synced, and
/// is renamed over `path`.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ArchiveError::NotFound(path.to_path_buf()))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| ArchiveError::Io(e.error))?;
    Ok(())
}

/// Create a symbolic link
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    symlink(target, link)?;
    Ok(())
}

/// Create a symbolic link
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Read the target of a symbolic link
pub fn read_symlink(path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(path)?)
}

/// Whether two paths are regular files sharing one inode
#[cfg(unix)]
pub fn are_hardlinked(a: &Path, b: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let ma = fs::symlink_metadata(a)?;
    let mb = fs::symlink_metadata(b)?;
    if !(ma.is_file() && mb.is_file()) {
        return Ok(false);
    }
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

/// Whether two paths are regular files sharing one inode
#[cfg(not(unix))]
pub fn are_hardlinked(_a: &Path, _b: &Path) -> Result<bool> {
    Ok(false)
}

/// Absolute path of an entry, resolving every component except the last
///
/// The parent directory must exist; the entry itself need not. A trailing
/// `..` forces full resolution.
pub fn absolute_entry_path(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path)?;
    match (abs.parent(), abs.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = fs::canonicalize(parent)
                .map_err(|_| ArchiveError::NotFound(parent.to_path_buf()))?;
            Ok(parent.join(name))
        }
        _ => fs::canonicalize(&abs).map_err(|_| ArchiveError::NotFound(abs.clone())),
    }
}

/// Whether anything (including a broken symlink) exists at `path`
pub fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Metadata of an entry without following symlinks; missing is `NotFound`
pub fn entry_metadata(path: &Path) -> Result<fs::Metadata> {
    fs::symlink_metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ArchiveError::NotFound(path.to_path_buf()),
        _ => ArchiveError::Io(e),
    })
}

/// Require a regular file or a symlink at `path`
pub fn require_file(path: &Path) -> Result<fs::Metadata> {
    let metadata = entry_metadata(path)?;
    let file_type = metadata.file_type();
    if !(file_type.is_file() || file_type.is_symlink()) {
        return Err(ArchiveError::NotAFile(path.to_path_buf()));
    }
    Ok(metadata)
}

/// Require a real directory (not a symlink to one) at `path`
pub fn require_dir(path: &Path) -> Result<fs::Metadata> {
    let metadata = entry_metadata(path)?;
    if !metadata.is_dir() {
        return Err(ArchiveError::NotADirectory(path.to_path_buf()));
    }
    Ok(metadata)
}

/// Require that nothing exists at `path`
pub fn require_absent(path: &Path) -> Result<()> {
    if entry_exists(path) {
        return Err(ArchiveError::AlreadyExists(path.to_path_buf()));
    }
    Ok(())
}

/// Final component of `path` as UTF-8
pub fn entry_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::invariant(format!("{:?} has no usable file name", path)))
}

/// Lexically normalize an absolute path: drop `.`, fold `..`
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// What kind of entry marks an archive root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Directory,
    File,
}

impl MarkerKind {
    fn matches(self, path: &Path) -> bool {
        match self {
            MarkerKind::Directory => path.is_dir(),
            MarkerKind::File => path.is_file(),
        }
    }
}

/// Outermost ancestor of `path` (itself included) holding a `marker` of `kind`
///
/// `path` need not exist. Ancestors are tried from the filesystem root
/// downwards, so an archive nested in another resolves to the outer one.
/// An entry named `marker` of the other kind is ignored.
pub fn locate_marked_ancestor(path: &Path, marker: &str, kind: MarkerKind) -> Result<Option<PathBuf>> {
    let abs = normalize_lexically(&std::path::absolute(path)?);
    let mut candidate = PathBuf::new();
    for component in abs.components() {
        candidate.push(component);
        if kind.matches(&candidate.join(marker)) {
            trace!("Found {:?} in {:?}", marker, candidate);
            return Ok(Some(fs::canonicalize(&candidate)?));
        }
    }
    Ok(None)
}

/// Duplicate pairs found by [`find_duplicates`]
#[derive(Debug, Default)]
pub struct DuplicateScan {
    /// Regular files digested
    pub files_scanned: usize,
    /// `(kept, disposed)` pairs in resolution order
    pub pairs: Vec<(PathBuf, PathBuf)>,
}

/// Find files with identical content below `dir`
///
/// The walk is depth-first with entries sorted by name. Symlinks are skipped
/// and so is the directory `skip`, if given. For each repeated digest, the
/// path seen first is kept unless its name ends with `duplicate_suffix`; the
/// kept path then stands for that digest. Pairs that already share an inode
/// are not reported.
pub fn find_duplicates(
    dir: &Path,
    duplicate_suffix: &str,
    skip: Option<&Path>,
) -> Result<DuplicateScan> {
    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| skip.map_or(true, |s| e.path() != s));

    let mut seen: std::collections::HashMap<ContentDigest, PathBuf> =
        std::collections::HashMap::new();
    let mut scan = DuplicateScan::default();

    for entry in walker {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            warn!("Skipping symlink {:?}", entry.path());
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let path = entry.into_path();
        let digest = digest_file(&path)?;
        scan.files_scanned += 1;

        let Some(original) = seen.get(&digest).cloned() else {
            seen.insert(digest, path);
            continue;
        };
        if are_hardlinked(&original, &path)? {
            trace!("{:?} and {:?} already share storage", original, path);
            continue;
        }

        let original_is_dup = original
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(duplicate_suffix));
        let (keep, dispose) = if original_is_dup {
            (path, original)
        } else {
            (original, path)
        };
        seen.insert(digest, keep.clone());
        scan.pairs.push((keep, dispose));
    }

    Ok(scan)
}
