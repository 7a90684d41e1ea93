//! Corruption tests for archman
//!
//! Damages an archive behind the engine's back (bit rot, lost files,
//! stray files, a tampered index) and checks that every kind of damage is
//! reported with the right error, and that undoing it makes the archive
//! pass again.

use ::archman::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};

use crate::integration::{ArchiveTestHarness, TreeConfig};

/// Injects damage into archived trees
pub struct CorruptionEngine {
    rng: StdRng,
}

impl CorruptionEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Flip one random bit of `path`, returning the original bytes
    pub fn flip_bit(&mut self, path: &Path) -> Vec<u8> {
        let original = fs::read(path).unwrap();
        assert!(!original.is_empty(), "cannot corrupt an empty file");

        let mut damaged = original.clone();
        let offset = self.rng.random_range(0..damaged.len());
        damaged[offset] ^= 1 << self.rng.random_range(0..8);
        rewrite(path, &damaged);
        original
    }

    /// Pick one of `paths`
    pub fn choose<'a>(&mut self, paths: &'a [PathBuf]) -> &'a Path {
        &paths[self.rng.random_range(0..paths.len())]
    }
}

/// Overwrite an archived file whose mode may be read-only
pub fn rewrite(path: &Path, content: &[u8]) {
    utils::set_permissions(path, 0o644).unwrap();
    fs::write(path, content).unwrap();
}

/// Run `f` with the parent directory of `path` writable
pub fn behind_the_back(path: &Path, f: impl FnOnce(&Path)) {
    let parent = path.parent().unwrap();
    let guard = utils::PermissionGuard::relax_preserving(parent, 0o755).unwrap();
    f(path);
    guard.finish().unwrap();
}

/// Archived regular files below `dir`
fn archived_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file() && fs::metadata(e.path()).unwrap().len() > 0)
        .map(|e| e.into_path())
        .collect()
}

fn populated() -> ArchiveTestHarness {
    let mut harness = ArchiveTestHarness::new();
    let src = harness.random_tree("tree", &TreeConfig::default());
    let root = harness.root.clone();
    harness.archive.add_dir(&src, &root.join("tree")).unwrap();
    harness.archive.commit().unwrap();
    harness
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_bit_rot_detected_and_repaired() {
        let harness = populated();
        let files = archived_files(&harness.root.join("tree"));
        let mut engine = CorruptionEngine::new(7);

        for _ in 0..5 {
            let victim = engine.choose(&files).to_path_buf();
            let original = engine.flip_bit(&victim);

            match harness.archive.check().unwrap_err() {
                ArchiveError::IntegrityMismatch { path, .. } => assert_eq!(path, victim),
                other => panic!("expected an integrity mismatch, got {}", other),
            }

            rewrite(&victim, &original);
            harness.archive.check().unwrap();
        }
    }

    #[test]
    fn test_export_refuses_rotten_file() {
        let mut harness = populated();
        let files = archived_files(&harness.root.join("tree"));
        let victim = files[0].clone();
        CorruptionEngine::new(3).flip_bit(&victim);

        let out = harness.outside("out");
        let err = harness.archive.export_file(&victim, &out).unwrap_err();
        assert!(err.is_integrity());

        let tree_out = harness.outside("tree-out");
        let root = harness.root.clone();
        let err = harness.archive.export_dir(&root.join("tree"), &tree_out).unwrap_err();
        assert!(err.is_integrity());

        // the engine itself keeps working
        let extra = harness.outside("extra");
        fs::write(&extra, b"extra").unwrap();
        harness.archive.add_file(&extra, &root.join("extra")).unwrap();
    }

    #[test]
    fn test_lost_file_and_folder() {
        let mut harness = populated();
        let root = harness.root.clone();
        let files = archived_files(&root.join("tree"));
        let victim = files.last().unwrap().clone();
        let saved = fs::read(&victim).unwrap();

        behind_the_back(&victim, |p| fs::remove_file(p).unwrap());
        let err = harness.archive.check().unwrap_err();
        assert_eq!(err.consistency_issue(), Some(ConsistencyIssue::MissingFile));

        behind_the_back(&victim, |p| fs::write(p, &saved).unwrap());
        harness.archive.check().unwrap();

        let folder = root.join("tree/lost");
        let empty = harness.outside("empty");
        fs::create_dir(&empty).unwrap();
        harness.archive.add_dir(&empty, &folder).unwrap();
        behind_the_back(&folder, |p| fs::remove_dir(p).unwrap());
        let err = harness.archive.check().unwrap_err();
        assert_eq!(err.consistency_issue(), Some(ConsistencyIssue::MissingDirectory));
    }

    #[test]
    fn test_stray_entries() {
        let harness = populated();
        let root = harness.root.clone();

        let stray = root.join("tree/stray.txt");
        behind_the_back(&stray, |p| fs::write(p, b"not tracked").unwrap());
        let err = harness.archive.check().unwrap_err();
        assert_eq!(err.consistency_issue(), Some(ConsistencyIssue::UntrackedFile));
        assert!(matches!(err, ArchiveError::Consistency { ref path, .. } if path == &stray));
        behind_the_back(&stray, |p| fs::remove_file(p).unwrap());

        let stray_dir = root.join("stray_dir");
        behind_the_back(&stray_dir, |p| fs::create_dir(p).unwrap());
        let err = harness.archive.check().unwrap_err();
        assert_eq!(err.consistency_issue(), Some(ConsistencyIssue::UntrackedDirectory));
        behind_the_back(&stray_dir, |p| fs::remove_dir(p).unwrap());

        harness.archive.check().unwrap();
    }

    #[test]
    fn test_interrupted_add_is_reported() {
        let harness = populated();
        let root = harness.root.clone();

        // filesystem half of an add, index half never ran
        let half_added = root.join("half");
        behind_the_back(&half_added, |p| fs::write(p, b"copied").unwrap());
        let err = harness.archive.check().unwrap_err();
        assert!(err.is_consistency());
        assert!(err.user_message().contains("disagree"));
    }

    #[test]
    fn test_tampered_index_refused_on_open() {
        let harness = populated();
        let root = harness.root.clone();
        let index = root.join(".archman/index.bin");

        let mut bytes = fs::read(&index).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x40;
        fs::write(&index, &bytes).unwrap();

        let err = Archive::open(&root, ArchiveConfig::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::IndexCorrupted { .. }));
        assert!(err.is_integrity());

        bytes[middle] ^= 0x40;
        fs::write(&index, &bytes).unwrap();
        let reopened = Archive::open(&root, ArchiveConfig::default()).unwrap();
        reopened.check().unwrap();
    }

    #[test]
    fn test_truncated_index_and_lost_sidecar() {
        let harness = populated();
        let root = harness.root.clone();
        let index = root.join(".archman/index.bin");
        let sidecar = root.join(".archman/index.sha256");

        let bytes = fs::read(&index).unwrap();
        fs::write(&index, &bytes[..bytes.len() / 3]).unwrap();
        let err = Archive::open(&root, ArchiveConfig::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::IndexCorrupted { .. }));

        fs::write(&index, &bytes).unwrap();
        fs::remove_file(&sidecar).unwrap();
        let err = Archive::locate(&root.join("tree"), ArchiveConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_commit_is_stable_without_changes() {
        let mut harness = populated();
        let sidecar = harness.root.join(".archman/index.sha256");

        let before = fs::read_to_string(&sidecar).unwrap();
        harness.archive.commit().unwrap();
        assert_eq!(fs::read_to_string(&sidecar).unwrap(), before);
    }
}
