//! Hierarchical index store
//!
//! This module provides [`IndexStore`], the persistent table of folder and
//! file records that is the source of truth for what an archive tracks.
//!
//! ## Layout
//!
//! Records are keyed by [`Uid`] and linked through `parent_uid`. Exactly one
//! folder record, the archive root, has no parent. The whole table is held in
//! memory while the store is open and written as a single bincode file on
//! [`IndexStore::commit`]:
//!
//! ```text
//! IndexSnapshot
//! ├── header      format version, archman version, creation time
//! ├── next_uid    next identifier to hand out
//! ├── folders     BTreeMap<Uid, FolderRecord>
//! └── files       BTreeMap<Uid, FileRecord>
//! ```
//!
//! The maps are ordered, so committing the same records twice produces the
//! same bytes; the integrity guard digest depends on that.
//!
//! ## Path resolution
//!
//! [`IndexStore::folder_from_path`] walks one component at a time from the
//! root, matching child folder names. Nothing is cached between calls.

use crate::error::{ArchiveError, Result};
use crate::types::{ContentDigest, FileRecord, FolderRecord, Uid};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, trace};

/// Reserved name of the root folder record
pub const ROOT_FOLDER_NAME: &str = ".";

/// Current on-disk format version
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Header stored at the start of every index file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHeader {
    /// On-disk format version
    pub format_version: u32,
    /// Version of archman that created the index
    pub archman_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    header: &'a IndexHeader,
    next_uid: u64,
    folders: &'a BTreeMap<Uid, FolderRecord>,
    files: &'a BTreeMap<Uid, FileRecord>,
}

#[derive(Deserialize)]
struct Snapshot {
    header: IndexHeader,
    next_uid: u64,
    folders: BTreeMap<Uid, FolderRecord>,
    files: BTreeMap<Uid, FileRecord>,
}

/// Folder query; `None` fields match anything
#[derive(Debug, Clone, Default)]
pub struct FolderFilter {
    /// Containing folder
    pub parent: Option<Uid>,
    /// Exact name
    pub name: Option<String>,
    /// Exact permission bits
    pub mode: Option<u32>,
}

impl FolderFilter {
    /// Children of `parent`
    pub fn children_of(parent: Uid) -> Self {
        Self {
            parent: Some(parent),
            ..Default::default()
        }
    }

    fn matches(&self, record: &FolderRecord) -> bool {
        self.parent.map_or(true, |p| record.parent_uid == Some(p))
            && self.name.as_deref().map_or(true, |n| record.name == n)
            && self.mode.map_or(true, |m| record.mode == m)
    }
}

/// File query; `None` fields match anything
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    /// Containing folder
    pub parent: Option<Uid>,
    /// Exact name
    pub name: Option<String>,
    /// Exact content digest
    pub digest: Option<ContentDigest>,
    /// Exact permission bits
    pub mode: Option<u32>,
}

impl FileFilter {
    /// Files directly inside `parent`
    pub fn children_of(parent: Uid) -> Self {
        Self {
            parent: Some(parent),
            ..Default::default()
        }
    }

    fn matches(&self, record: &FileRecord) -> bool {
        self.parent.map_or(true, |p| record.parent_uid == p)
            && self.name.as_deref().map_or(true, |n| record.name == n)
            && self.digest.map_or(true, |d| record.digest == d)
            && self.mode.map_or(true, |m| record.mode == m)
    }
}

/// One step of a [`TreeWalk`]: a folder and its direct children
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Folder being visited
    pub folder_uid: Uid,
    /// File records directly inside it, name-sorted
    pub files: Vec<(Uid, FileRecord)>,
    /// Folder records directly inside it, name-sorted
    pub folders: Vec<(Uid, FolderRecord)>,
}

/// Depth-first, pre-order traversal of the folder tree
///
/// Each call to [`IndexStore::walk_from`] starts a fresh traversal; a walk
/// cannot be resumed once dropped.
pub struct TreeWalk<'a> {
    store: &'a IndexStore,
    stack: Vec<Uid>,
}

impl Iterator for TreeWalk<'_> {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<WalkEntry> {
        let folder_uid = self.stack.pop()?;
        let files = self.store.sorted_files(folder_uid);
        let folders = self.store.sorted_folders(folder_uid);
        self.stack.extend(folders.iter().rev().map(|(uid, _)| *uid));
        Some(WalkEntry {
            folder_uid,
            files,
            folders,
        })
    }
}

/// Persistent hierarchical table of folder and file records
#[derive(Debug)]
pub struct IndexStore {
    /// Index file on disk
    path: PathBuf,
    /// Archive root that record paths are relative to
    root: PathBuf,
    header: IndexHeader,
    next_uid: u64,
    root_uid: Uid,
    folders: BTreeMap<Uid, FolderRecord>,
    files: BTreeMap<Uid, FileRecord>,
    /// parent -> child folders, rebuilt on open
    folder_children: HashMap<Uid, BTreeSet<Uid>>,
    /// parent -> child files, rebuilt on open
    file_children: HashMap<Uid, BTreeSet<Uid>>,
    dirty: bool,
}

impl IndexStore {
    /// Open or initialize the index at `path` for the archive at `root`
    ///
    /// With `create`, the index file must not exist yet; a single root folder
    /// record is inserted and flushed to disk. Without `create`, the file must
    /// exist.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::AlreadyExists`] if `create` and the file exists
    /// - [`ArchiveError::NotFound`] if not `create` and the file is missing
    /// - [`ArchiveError::IndexFormat`] if the file is not a valid index
    pub fn open(path: &Path, root: &Path, create: bool) -> Result<Self> {
        let exists = path.exists();
        if create && exists {
            return Err(ArchiveError::AlreadyExists(path.to_path_buf()));
        }
        if !create && !exists {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }

        if create {
            Self::create(path, root)
        } else {
            Self::load(path, root)
        }
    }

    fn create(path: &Path, root: &Path) -> Result<Self> {
        let root_mode = utils::entry_mode(root)?;
        let root_uid = Uid(1);
        let mut folders = BTreeMap::new();
        folders.insert(
            root_uid,
            FolderRecord {
                parent_uid: None,
                name: ROOT_FOLDER_NAME.to_string(),
                mode: root_mode,
            },
        );

        let mut store = Self {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
            header: IndexHeader {
                format_version: INDEX_FORMAT_VERSION,
                archman_version: env!("CARGO_PKG_VERSION").to_string(),
                created_at: Utc::now(),
            },
            next_uid: root_uid.0 + 1,
            root_uid,
            folders,
            files: BTreeMap::new(),
            folder_children: HashMap::new(),
            file_children: HashMap::new(),
            dirty: true,
        };
        store.commit()?;

        info!("Created index at {:?}", path);
        Ok(store)
    }

    fn load(path: &Path, root: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let (snapshot, _): (Snapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| ArchiveError::IndexFormat(e.to_string()))?;

        if snapshot.header.format_version != INDEX_FORMAT_VERSION {
            return Err(ArchiveError::IndexFormat(format!(
                "unsupported format version {}",
                snapshot.header.format_version
            )));
        }

        let mut roots = snapshot
            .folders
            .iter()
            .filter(|(_, f)| f.parent_uid.is_none())
            .map(|(uid, _)| *uid);
        let root_uid = match (roots.next(), roots.next()) {
            (Some(uid), None) => uid,
            _ => {
                return Err(ArchiveError::IndexFormat(
                    "index must contain exactly one root folder".to_string(),
                ))
            }
        };

        let mut folder_children: HashMap<Uid, BTreeSet<Uid>> = HashMap::new();
        for (uid, folder) in &snapshot.folders {
            if let Some(parent) = folder.parent_uid {
                folder_children.entry(parent).or_default().insert(*uid);
            }
        }
        let mut file_children: HashMap<Uid, BTreeSet<Uid>> = HashMap::new();
        for (uid, file) in &snapshot.files {
            file_children.entry(file.parent_uid).or_default().insert(*uid);
        }

        debug!(
            "Loaded index {:?}: {} folders, {} files",
            path,
            snapshot.folders.len(),
            snapshot.files.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
            header: snapshot.header,
            next_uid: snapshot.next_uid,
            root_uid,
            folders: snapshot.folders,
            files: snapshot.files,
            folder_children,
            file_children,
            dirty: false,
        })
    }

    /// Durably flush all records to the index file
    pub fn commit(&mut self) -> Result<()> {
        let snapshot = SnapshotRef {
            header: &self.header,
            next_uid: self.next_uid,
            folders: &self.folders,
            files: &self.files,
        };
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
        utils::atomic_write(&self.path, &bytes)?;
        self.dirty = false;

        debug!(
            "Committed index {:?} ({} folders, {} files, {} bytes)",
            self.path,
            self.folders.len(),
            self.files.len(),
            bytes.len()
        );
        Ok(())
    }

    /// Whether records changed since the last commit
    pub fn has_pending_changes(&self) -> bool {
        self.dirty
    }

    /// Index file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Index header
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Identifier of the root folder record
    pub fn root_uid(&self) -> Uid {
        self.root_uid
    }

    /// Number of folder records, root included
    pub fn folder_count(&self) -> usize {
        self.folders.len()
    }

    /// Number of file records
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn allocate_uid(&mut self) -> Uid {
        let uid = Uid(self.next_uid);
        self.next_uid += 1;
        uid
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name == ROOT_FOLDER_NAME || name == ".." || name.contains('/') {
            return Err(ArchiveError::invariant(format!("invalid entry name {:?}", name)));
        }
        Ok(())
    }

    /// Reject a name already used by a sibling folder or file other than `except`
    fn check_unique(&self, parent: Uid, name: &str, except: Option<Uid>) -> Result<()> {
        let taken = self
            .child_folder_named(parent, name)
            .or_else(|| self.child_file_named(parent, name))
            .is_some_and(|uid| Some(uid) != except);
        if taken {
            let path = self.path_from_folder_uid(parent)?.join(name);
            return Err(ArchiveError::AlreadyExists(path));
        }
        Ok(())
    }

    fn check_parent(&self, parent: Uid) -> Result<()> {
        if !self.folders.contains_key(&parent) {
            return Err(ArchiveError::invariant(format!("parent folder {} does not exist", parent)));
        }
        Ok(())
    }

    fn child_folder_named(&self, parent: Uid, name: &str) -> Option<Uid> {
        self.folder_children
            .get(&parent)?
            .iter()
            .copied()
            .find(|uid| self.folders.get(uid).is_some_and(|f| f.name == name))
    }

    fn child_file_named(&self, parent: Uid, name: &str) -> Option<Uid> {
        self.file_children
            .get(&parent)?
            .iter()
            .copied()
            .find(|uid| self.files.get(uid).is_some_and(|f| f.name == name))
    }

    /// Insert a folder record
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::InvariantViolation`] for a parentless record (only the
    ///   root may have none, and it already exists), an unknown parent or an
    ///   invalid name
    /// - [`ArchiveError::AlreadyExists`] if a sibling already uses the name
    pub fn add_folder(&mut self, record: FolderRecord) -> Result<Uid> {
        let parent = match record.parent_uid {
            Some(parent) => parent,
            None if record.name != ROOT_FOLDER_NAME => {
                return Err(ArchiveError::invariant("parent_uid cannot be null"));
            }
            None => {
                return Err(ArchiveError::invariant("the archive root folder already exists"));
            }
        };
        Self::check_name(&record.name)?;
        self.check_parent(parent)?;
        self.check_unique(parent, &record.name, None)?;

        let uid = self.allocate_uid();
        debug!("Index add folder {} {:?} under {}", uid, record.name, parent);
        self.folder_children.entry(parent).or_default().insert(uid);
        self.folders.insert(uid, record);
        self.dirty = true;
        Ok(uid)
    }

    /// Insert a file record
    pub fn add_file(&mut self, record: FileRecord) -> Result<Uid> {
        Self::check_name(&record.name)?;
        self.check_parent(record.parent_uid)?;
        self.check_unique(record.parent_uid, &record.name, None)?;

        let uid = self.allocate_uid();
        debug!(
            "Index add file {} {:?} under {} ({})",
            uid,
            record.name,
            record.parent_uid,
            record.digest.short()
        );
        self.file_children.entry(record.parent_uid).or_default().insert(uid);
        self.files.insert(uid, record);
        self.dirty = true;
        Ok(uid)
    }

    /// Overwrite every field of an existing folder record
    ///
    /// Re-parenting a folder under itself or one of its descendants is
    /// rejected, as is any change to the root's parent or name.
    pub fn update_folder(&mut self, uid: Uid, record: FolderRecord) -> Result<()> {
        let old_parent = self
            .folders
            .get(&uid)
            .ok_or_else(|| ArchiveError::invariant(format!("unknown folder {}", uid)))?
            .parent_uid;

        if uid == self.root_uid {
            if record.parent_uid.is_some() || record.name != ROOT_FOLDER_NAME {
                return Err(ArchiveError::invariant("the archive root cannot be moved or renamed"));
            }
        } else {
            let parent = record
                .parent_uid
                .ok_or_else(|| ArchiveError::invariant("parent_uid cannot be null"))?;
            Self::check_name(&record.name)?;
            self.check_parent(parent)?;
            if self.is_same_or_descendant(parent, uid) {
                return Err(ArchiveError::invariant(format!(
                    "folder {} cannot be moved inside itself",
                    uid
                )));
            }
            self.check_unique(parent, &record.name, Some(uid))?;
        }

        if old_parent != record.parent_uid {
            if let Some(old) = old_parent {
                if let Some(children) = self.folder_children.get_mut(&old) {
                    children.remove(&uid);
                }
            }
            if let Some(new) = record.parent_uid {
                self.folder_children.entry(new).or_default().insert(uid);
            }
        }

        debug!("Index update folder {} -> {:?}", uid, record.name);
        self.folders.insert(uid, record);
        self.dirty = true;
        Ok(())
    }

    /// Overwrite every field of an existing file record
    pub fn update_file(&mut self, uid: Uid, record: FileRecord) -> Result<()> {
        let old_parent = self
            .files
            .get(&uid)
            .ok_or_else(|| ArchiveError::invariant(format!("unknown file {}", uid)))?
            .parent_uid;
        Self::check_name(&record.name)?;
        self.check_parent(record.parent_uid)?;
        self.check_unique(record.parent_uid, &record.name, Some(uid))?;

        if old_parent != record.parent_uid {
            if let Some(children) = self.file_children.get_mut(&old_parent) {
                children.remove(&uid);
            }
            self.file_children.entry(record.parent_uid).or_default().insert(uid);
        }

        debug!("Index update file {} -> {:?} ({})", uid, record.name, record.digest.short());
        self.files.insert(uid, record);
        self.dirty = true;
        Ok(())
    }

    /// Remove a single file record
    pub fn delete_file(&mut self, uid: Uid) -> Result<()> {
        let record = self
            .files
            .remove(&uid)
            .ok_or_else(|| ArchiveError::invariant(format!("unknown file {}", uid)))?;
        if let Some(children) = self.file_children.get_mut(&record.parent_uid) {
            children.remove(&uid);
        }
        debug!("Index delete file {} {:?}", uid, record.name);
        self.dirty = true;
        Ok(())
    }

    /// Remove a folder record and everything below it
    ///
    /// Files directly inside the folder go first, then each child folder
    /// recursively, then the folder itself.
    pub fn delete_folder(&mut self, uid: Uid) -> Result<()> {
        if uid == self.root_uid {
            return Err(ArchiveError::invariant("the archive root folder cannot be deleted"));
        }
        if !self.folders.contains_key(&uid) {
            return Err(ArchiveError::invariant(format!("unknown folder {}", uid)));
        }

        for file_uid in self.file_children.remove(&uid).unwrap_or_default() {
            self.files.remove(&file_uid);
        }
        let children: Vec<Uid> = self
            .folder_children
            .get(&uid)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        for child in children {
            self.delete_folder(child)?;
        }
        self.folder_children.remove(&uid);

        if let Some(record) = self.folders.remove(&uid) {
            if let Some(parent) = record.parent_uid {
                if let Some(siblings) = self.folder_children.get_mut(&parent) {
                    siblings.remove(&uid);
                }
            }
            debug!("Index delete folder {} {:?}", uid, record.name);
        }
        self.dirty = true;
        Ok(())
    }

    /// Folder records matching `filter`, in identifier order
    pub fn folders(&self, filter: &FolderFilter) -> Vec<(Uid, FolderRecord)> {
        match filter.parent {
            Some(parent) => self
                .folder_children
                .get(&parent)
                .into_iter()
                .flatten()
                .filter_map(|uid| self.folders.get(uid).map(|f| (*uid, f)))
                .filter(|(_, f)| filter.matches(f))
                .map(|(uid, f)| (uid, f.clone()))
                .collect(),
            None => self
                .folders
                .iter()
                .filter(|(_, f)| filter.matches(f))
                .map(|(uid, f)| (*uid, f.clone()))
                .collect(),
        }
    }

    /// File records matching `filter`, in identifier order
    pub fn files(&self, filter: &FileFilter) -> Vec<(Uid, FileRecord)> {
        match filter.parent {
            Some(parent) => self
                .file_children
                .get(&parent)
                .into_iter()
                .flatten()
                .filter_map(|uid| self.files.get(uid).map(|f| (*uid, f)))
                .filter(|(_, f)| filter.matches(f))
                .map(|(uid, f)| (uid, f.clone()))
                .collect(),
            None => self
                .files
                .iter()
                .filter(|(_, f)| filter.matches(f))
                .map(|(uid, f)| (*uid, f.clone()))
                .collect(),
        }
    }

    fn sorted_folders(&self, parent: Uid) -> Vec<(Uid, FolderRecord)> {
        let mut folders = self.folders(&FolderFilter::children_of(parent));
        folders.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        folders
    }

    fn sorted_files(&self, parent: Uid) -> Vec<(Uid, FileRecord)> {
        let mut files = self.files(&FileFilter::children_of(parent));
        files.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        files
    }

    /// Look up a folder record by identifier
    pub fn folder_from_uid(&self, uid: Uid) -> Result<FolderRecord> {
        self.folders
            .get(&uid)
            .cloned()
            .ok_or_else(|| ArchiveError::invariant(format!("unknown folder {}", uid)))
    }

    /// Look up a file record by identifier
    pub fn file_from_uid(&self, uid: Uid) -> Result<FileRecord> {
        self.files
            .get(&uid)
            .cloned()
            .ok_or_else(|| ArchiveError::invariant(format!("unknown file {}", uid)))
    }

    /// Path relative to the root; absolute paths must lie under the root
    fn relative<'p>(&self, path: &'p Path) -> Result<&'p Path> {
        if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| ArchiveError::NotInArchive(path.to_path_buf()))
        } else {
            Ok(path)
        }
    }

    /// Resolve a folder path to its record
    ///
    /// `path` is either relative to the archive root or an absolute path
    /// below it. An empty relative path names the root.
    pub fn folder_from_path(&self, path: &Path) -> Result<(Uid, FolderRecord)> {
        let relative = self.relative(path)?;
        let mut current = self.root_uid;

        for component in relative.components() {
            let name = match component {
                Component::CurDir => continue,
                Component::Normal(name) => name.to_string_lossy(),
                _ => return Err(ArchiveError::NotInArchive(path.to_path_buf())),
            };
            trace!("Resolving {:?} under {}", name, current);
            current = self
                .child_folder_named(current, &name)
                .ok_or_else(|| ArchiveError::NotFound(self.root.join(relative)))?;
        }

        Ok((current, self.folder_from_uid(current)?))
    }

    /// Resolve a file path to its record
    pub fn file_from_path(&self, path: &Path) -> Result<(Uid, FileRecord)> {
        let relative = self.relative(path)?;
        let name = relative
            .file_name()
            .ok_or_else(|| ArchiveError::NotFound(self.root.join(relative)))?;
        let parent = relative.parent().unwrap_or_else(|| Path::new(""));
        let (parent_uid, _) = self.folder_from_path(parent)?;

        let uid = self
            .child_file_named(parent_uid, &name.to_string_lossy())
            .ok_or_else(|| ArchiveError::NotFound(self.root.join(relative)))?;
        Ok((uid, self.file_from_uid(uid)?))
    }

    /// Absolute path of a folder, built by walking parent links to the root
    pub fn path_from_folder_uid(&self, uid: Uid) -> Result<PathBuf> {
        let mut parts = Vec::new();
        let mut current = Some(uid);

        while let Some(id) = current {
            if parts.len() > self.folders.len() {
                return Err(ArchiveError::invariant(format!("cycle in folder parents at {}", uid)));
            }
            let folder = self
                .folders
                .get(&id)
                .ok_or_else(|| ArchiveError::invariant(format!("unknown folder {}", id)))?;
            if folder.parent_uid.is_some() {
                parts.push(folder.name.as_str());
            }
            current = folder.parent_uid;
        }

        let mut path = self.root.clone();
        for part in parts.iter().rev() {
            path.push(part);
        }
        Ok(path)
    }

    /// Absolute path of a file
    pub fn path_from_file_uid(&self, uid: Uid) -> Result<PathBuf> {
        let file = self
            .files
            .get(&uid)
            .ok_or_else(|| ArchiveError::invariant(format!("unknown file {}", uid)))?;
        Ok(self.path_from_folder_uid(file.parent_uid)?.join(&file.name))
    }

    /// Walk the tree below the folder at `path`
    pub fn walk(&self, path: &Path) -> Result<TreeWalk<'_>> {
        let (uid, _) = self.folder_from_path(path)?;
        Ok(self.walk_from(uid))
    }

    /// Walk the tree below the folder `uid`
    pub fn walk_from(&self, uid: Uid) -> TreeWalk<'_> {
        TreeWalk {
            store: self,
            stack: vec![uid],
        }
    }

    /// Whether `candidate` is `ancestor` or lies below it
    fn is_same_or_descendant(&self, candidate: Uid, ancestor: Uid) -> bool {
        let mut current = Some(candidate);
        let mut steps = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.folders.len() {
                return false;
            }
            current = self.folders.get(&id).and_then(|f| f.parent_uid);
        }
        false
    }
}
