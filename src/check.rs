//! Consistency checker
//!
//! Walks the index from the archive root and compares every visited folder
//! against the live directory it describes. The walk stops at the first
//! divergence:
//!
//! | on disk | in the index | result |
//! |---|---|---|
//! | file or symlink | no file record | `UntrackedFile` |
//! | directory | no folder record | `UntrackedDirectory` |
//! | nothing | file record | `MissingFile` |
//! | nothing | folder record | `MissingDirectory` |
//! | file with other bytes | file record | `IntegrityMismatch` |
//! | fifo, socket, device | anything | `UnsupportedEntry` |
//!
//! The metadata directory at the archive root is never reported.

use crate::error::{ArchiveError, ConsistencyIssue, Result};
use crate::index::IndexStore;
use crate::types::CheckStats;
use crate::utils;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, trace};

/// Read-only audit of one archive
pub struct ConsistencyChecker<'a> {
    index: &'a IndexStore,
    index_dir_name: &'a str,
}

impl<'a> ConsistencyChecker<'a> {
    /// Checker over `index`, ignoring `index_dir_name` at the root
    pub fn new(index: &'a IndexStore, index_dir_name: &'a str) -> Self {
        Self {
            index,
            index_dir_name,
        }
    }

    /// Run the audit
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::Consistency`] for the first untracked or missing entry
    /// - [`ArchiveError::IntegrityMismatch`] for the first file whose bytes
    ///   no longer match its record
    pub fn run(&self) -> Result<CheckStats> {
        let root_uid = self.index.root_uid();
        let mut stats = CheckStats::default();

        for entry in self.index.walk_from(root_uid) {
            let dir = self.index.path_from_folder_uid(entry.folder_uid)?;
            trace!("Checking {:?}", dir);

            let tracked_files: HashMap<&str, _> = entry
                .files
                .iter()
                .map(|(_, f)| (f.name.as_str(), f))
                .collect();
            let tracked_dirs: HashSet<&str> =
                entry.folders.iter().map(|(_, f)| f.name.as_str()).collect();

            let mut live_files = HashSet::new();
            let mut live_dirs = HashSet::new();

            let mut children = fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
            children.sort_by_key(|c| c.file_name());

            for child in children {
                let name = child.file_name().to_string_lossy().into_owned();
                let path = child.path();
                let file_type = child.file_type()?;

                if file_type.is_file() || file_type.is_symlink() {
                    if !tracked_files.contains_key(name.as_str()) {
                        return Err(ArchiveError::consistency(ConsistencyIssue::UntrackedFile, path));
                    }
                    live_files.insert(name);
                } else if file_type.is_dir() {
                    if entry.folder_uid == root_uid && name == self.index_dir_name {
                        continue;
                    }
                    if !tracked_dirs.contains(name.as_str()) {
                        return Err(ArchiveError::consistency(
                            ConsistencyIssue::UntrackedDirectory,
                            path,
                        ));
                    }
                    live_dirs.insert(name);
                } else {
                    return Err(ArchiveError::consistency(ConsistencyIssue::UnsupportedEntry, path));
                }
            }

            for (_, record) in &entry.files {
                let path = dir.join(&record.name);
                if !live_files.contains(&record.name) {
                    return Err(ArchiveError::consistency(ConsistencyIssue::MissingFile, path));
                }
                verify_file(&path, record)?;
                stats.files += 1;
            }

            for (_, record) in &entry.folders {
                if !live_dirs.contains(&record.name) {
                    return Err(ArchiveError::consistency(
                        ConsistencyIssue::MissingDirectory,
                        dir.join(&record.name),
                    ));
                }
            }

            stats.folders += 1;
        }

        info!("Consistency check passed: {} folders, {} files", stats.folders, stats.files);
        Ok(stats)
    }
}

/// Compare the live digest of `path` with its record
pub(crate) fn verify_file(path: &Path, record: &crate::types::FileRecord) -> Result<()> {
    let actual = utils::digest_entry(path)?;
    if actual != record.digest {
        debug!("Digest mismatch for {:?}", path);
        return Err(ArchiveError::IntegrityMismatch {
            path: path.to_path_buf(),
            expected: record.digest.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}
