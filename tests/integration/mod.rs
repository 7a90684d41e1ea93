//! Integration tests for archman
//!
//! End-to-end scenarios over realistic trees: numbered fixture files and
//! folders, seeded random trees and multi-step workflows, each checked
//! against the index and exported back out.

use ::archman::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Test harness owning one archive and a scratch area next to it
pub struct ArchiveTestHarness {
    pub temp_dir: TempDir,
    /// Canonical scratch directory; the archive lives at `base/archive_root`
    pub base: PathBuf,
    pub root: PathBuf,
    pub archive: Archive,
    pub file_generator: FileGenerator,
}

impl ArchiveTestHarness {
    /// Create a new harness with an empty archive
    pub fn new() -> Self {
        Self::with_config(ArchiveConfig::default())
    }

    pub fn with_config(config: ArchiveConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let base = fs::canonicalize(temp_dir.path()).unwrap();
        let root = base.join("archive_root");
        let archive = Archive::create(&root, config).unwrap();

        Self {
            temp_dir,
            base,
            root,
            archive,
            file_generator: FileGenerator::new(42),
        }
    }

    /// Path in the scratch area, outside the archive
    pub fn outside(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }

    /// `count` files named `f0000`, `f0001`, ... each holding its own name
    pub fn numbered_files(&self, count: usize) -> PathBuf {
        let dir = self.base.join("files");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let name = format!("f{:04}", i);
            fs::write(dir.join(&name), &name).unwrap();
        }
        dir
    }

    /// `count` empty folders named `d0000`, `d0001`, ...
    pub fn numbered_dirs(&self, count: usize) -> PathBuf {
        let dir = self.base.join("dirs");
        for i in 0..count {
            fs::create_dir_all(dir.join(format!("d{:04}", i))).unwrap();
        }
        dir
    }

    /// Seeded random tree at `rel` in the scratch area
    pub fn random_tree(&mut self, rel: &str, config: &TreeConfig) -> PathBuf {
        let dir = self.base.join(rel);
        fs::create_dir_all(&dir).unwrap();
        self.file_generator.populate(&dir, config, 0);
        dir
    }

    /// Close the archive and open it again from disk
    pub fn reopen(&mut self) {
        self.archive = Archive::open(&self.root, self.archive.config().clone()).unwrap();
    }
}

impl Drop for ArchiveTestHarness {
    fn drop(&mut self) {
        let _ = utils::remove_tree_forced(&self.base, 0o755);
    }
}

/// Deterministic fixture content
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generate realistic file content
    pub fn generate_file_content(&mut self, size_range: std::ops::Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        let mut content = Vec::with_capacity(size);

        let words = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "lorem", "ipsum"];
        while content.len() < size {
            let word = words[self.rng.random_range(0..words.len())];
            content.extend_from_slice(word.as_bytes());
            content.push(b' ');
        }

        content.truncate(size);
        content
    }

    /// Generate binary file content
    pub fn generate_binary_content(&mut self, size: usize) -> Vec<u8> {
        let mut content = vec![0u8; size];
        self.rng.fill(&mut content[..]);
        content
    }

    /// Fill `dir` with files and, below `config.max_depth`, sub folders
    ///
    /// Returns the number of files written.
    pub fn populate(&mut self, dir: &Path, config: &TreeConfig, depth: usize) -> usize {
        let mut written = 0;

        let files = self.rng.random_range(1..=config.files_per_dir);
        for i in 0..files {
            let content = if self.rng.random_bool(0.2) {
                let size = self.rng.random_range(config.file_size_range.clone());
                self.generate_binary_content(size)
            } else {
                self.generate_file_content(config.file_size_range.clone())
            };
            fs::write(dir.join(format!("file_{:02}.txt", i)), content).unwrap();
            written += 1;
        }

        if depth < config.max_depth {
            let dirs = self.rng.random_range(0..=config.dirs_per_level);
            for i in 0..dirs {
                let sub = dir.join(format!("dir_{:02}", i));
                fs::create_dir(&sub).unwrap();
                written += self.populate(&sub, config, depth + 1);
            }
        }

        written
    }
}

#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub max_depth: usize,
    pub dirs_per_level: usize,
    pub files_per_dir: usize,
    pub file_size_range: std::ops::Range<usize>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            dirs_per_level: 3,
            files_per_dir: 5,
            file_size_range: 1..4_096,
        }
    }
}

/// Relative path → content for every entry below `dir`
///
/// Directories map to `None`, symlinks to their target text.
pub fn snapshot_tree(dir: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    let mut snapshot = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(dir).unwrap().to_path_buf();
        let content = if entry.file_type().is_dir() {
            None
        } else if entry.file_type().is_symlink() {
            Some(fs::read_link(entry.path()).unwrap().into_os_string().into_encoded_bytes())
        } else {
            Some(fs::read(entry.path()).unwrap())
        };
        snapshot.insert(rel, content);
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;
    use tracing_test::traced_test;

    #[test]
    fn test_list_empty_archive() {
        let harness = ArchiveTestHarness::new();
        let listing = harness.archive.list(&harness.root, true).unwrap();
        assert!(listing.is_empty());
        harness.archive.check().unwrap();
    }

    #[test]
    fn test_single_numbered_file() {
        let mut harness = ArchiveTestHarness::new();
        let files = harness.numbered_files(3);
        let out = harness.outside("out");
        let root = harness.root.clone();
        let archive = &mut harness.archive;

        archive.add_file(&files.join("f0000"), &root.join("f0000")).unwrap();
        archive.commit().unwrap();

        assert_eq!(archive.list(&root, false).unwrap().paths(), vec!["f0000"]);
        archive.export_file(&root.join("f0000"), &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"f0000");
    }

    #[test]
    fn test_nested_dirs_need_recursive_listing() {
        let mut harness = ArchiveTestHarness::new();
        let dirs = harness.numbered_dirs(2);
        let root = harness.root.clone();
        let archive = &mut harness.archive;

        archive.add_dir(&dirs.join("d0000"), &root.join("d0000")).unwrap();
        assert_eq!(archive.list(&root, false).unwrap().paths(), vec!["d0000/"]);

        archive.add_dir(&dirs.join("d0001"), &root.join("d0000/d0001")).unwrap();
        assert_eq!(archive.list(&root, false).unwrap().paths(), vec!["d0000/"]);
        assert_eq!(
            archive.list(&root, true).unwrap().paths(),
            vec!["d0000/", "d0000/d0001/"]
        );
        archive.check().unwrap();
    }

    #[test]
    fn test_many_files_in_one_folder() {
        let mut harness = ArchiveTestHarness::new();
        let files = harness.numbered_files(100);
        let root = harness.root.clone();
        let archive = &mut harness.archive;

        for i in (0..100).rev() {
            let name = format!("f{:04}", i);
            archive.add_file(&files.join(&name), &root.join(&name)).unwrap();
        }
        archive.commit().unwrap();

        let paths = archive.list(&root, false).unwrap().paths();
        let expected: Vec<String> = (0..100).map(|i| format!("f{:04}", i)).collect();
        assert_eq!(paths, expected);
        assert_eq!(archive.check().unwrap().files, 100);
    }

    #[test]
    #[traced_test]
    fn test_random_tree_roundtrip() {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.random_tree("random_tree", &TreeConfig::default());
        let root = harness.root.clone();

        harness.archive.add_dir(&src, &root.join("random_tree")).unwrap();
        harness.archive.commit().unwrap();
        harness.reopen();

        let stats = harness.archive.check().unwrap();
        info!("random tree: {} folders, {} files", stats.folders, stats.files);
        assert!(logs_contain("random tree:"));

        let out = harness.outside("restored");
        harness.archive.export_dir(&root.join("random_tree"), &out).unwrap();
        assert_eq!(snapshot_tree(&src), snapshot_tree(&out));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_survives_add_and_export() {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("src");
        fs::create_dir(&src).unwrap();
        utils::create_symlink(Path::new("../elsewhere/target"), &src.join("link")).unwrap();
        let out = harness.outside("exported-link");
        let root = harness.root.clone();
        let archive = &mut harness.archive;

        archive.add_file(&src.join("link"), &root.join("link")).unwrap();
        archive.check().unwrap();

        archive.export_file(&root.join("link"), &out).unwrap();
        assert_eq!(fs::read_link(&out).unwrap(), PathBuf::from("../elsewhere/target"));
    }

    #[cfg(unix)]
    #[test]
    fn test_dedup_hardlink_then_export() {
        use std::os::unix::fs::MetadataExt;

        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("photos");
        let out = harness.outside("out");
        fs::create_dir_all(src.join("2023")).unwrap();
        fs::create_dir_all(src.join("2024")).unwrap();
        for path in ["2023/a.jpg", "2023/b.jpg", "2024/a.jpg", "2024/c.jpg.dup"] {
            fs::write(src.join(path), b"same picture").unwrap();
        }
        fs::write(src.join("2024/other.jpg"), b"another picture").unwrap();

        let root = harness.root.clone();
        let archive = &mut harness.archive;
        archive.add_dir(&src, &root.join("photos")).unwrap();

        let report = archive.dedup(&root.join("photos"), true).unwrap();
        assert_eq!(report.duplicates(), 3);
        archive.commit().unwrap();

        let ino = fs::metadata(root.join("photos/2023/a.jpg")).unwrap().ino();
        for path in ["2023/b.jpg", "2024/a.jpg", "2024/c.jpg.dup"] {
            assert_eq!(fs::metadata(root.join("photos").join(path)).unwrap().ino(), ino);
        }
        archive.check().unwrap();

        archive.export_dir(&root.join("photos"), &out).unwrap();
        assert_eq!(snapshot_tree(&src), snapshot_tree(&out));
        // exported copies are independent files
        assert_ne!(
            fs::metadata(out.join("2023/a.jpg")).unwrap().ino(),
            fs::metadata(out.join("2023/b.jpg")).unwrap().ino()
        );
    }

    #[test]
    fn test_dedup_remove_leaves_unique_content() {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("docs");
        let out = harness.outside("out");
        fs::create_dir_all(src.join("old")).unwrap();
        fs::write(src.join("report.txt"), b"v1").unwrap();
        fs::write(src.join("old/report.txt"), b"v1").unwrap();
        fs::write(src.join("old/draft.txt"), b"v0").unwrap();
        fs::write(src.join("old/draft.txt.dup"), b"v0").unwrap();

        let root = harness.root.clone();
        let archive = &mut harness.archive;
        archive.add_dir(&src, &root.join("docs")).unwrap();
        let report = archive.dedup(&root.join("docs"), false).unwrap();
        assert_eq!(report.duplicates(), 2);
        archive.commit().unwrap();
        archive.check().unwrap();

        archive.export_dir(&root.join("docs"), &out).unwrap();
        let mut contents: Vec<Vec<u8>> = snapshot_tree(&out).into_values().flatten().collect();
        contents.sort();
        assert_eq!(contents, vec![b"v0".to_vec(), b"v1".to_vec()]);
        assert!(out.join("old/draft.txt").exists());
        assert!(!out.join("old/draft.txt.dup").exists());
    }

    #[test]
    fn test_reorganize_and_update() {
        let mut harness = ArchiveTestHarness::new();
        let files = harness.numbered_files(4);
        let dirs = harness.numbered_dirs(2);
        let root = harness.root.clone();
        let archive = &mut harness.archive;

        archive.add_dir(&dirs.join("d0000"), &root.join("inbox")).unwrap();
        archive.add_dir(&dirs.join("d0001"), &root.join("done")).unwrap();
        for i in 0..3 {
            let name = format!("f{:04}", i);
            archive.add_file(&files.join(&name), &root.join("inbox").join(&name)).unwrap();
        }

        archive.move_file(&root.join("inbox/f0000"), &root.join("done/first")).unwrap();
        archive.update_file(&files.join("f0003"), &root.join("inbox/f0001")).unwrap();
        archive.move_dir(&root.join("inbox"), &root.join("done/inbox")).unwrap();
        archive.commit().unwrap();

        assert_eq!(
            archive.list(&root, true).unwrap().paths(),
            vec!["done/", "done/inbox/", "done/inbox/f0001", "done/inbox/f0002", "done/first"]
        );
        let (_, record) = archive.index().file_from_path(Path::new("done/inbox/f0001")).unwrap();
        assert_eq!(record.digest, utils::digest_bytes(b"f0003"));
        archive.check().unwrap();
    }

    #[test]
    fn test_reference_backend_matches_engine_on_random_tree() {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.random_tree("tree", &TreeConfig {
            max_depth: 2,
            ..Default::default()
        });

        let reference_root = harness.outside("reference");
        let mut reference = ArchiveBuilder::new()
            .kind(ArchiveKind::Reference)
            .create_backend(&reference_root)
            .unwrap();
        reference.add_dir(&src, &reference_root.join("tree")).unwrap();

        let root = harness.root.clone();
        harness.archive.add_dir(&src, &root.join("tree")).unwrap();

        assert_eq!(
            harness.archive.list(&root, true).unwrap().paths(),
            reference.list(&reference_root, true).unwrap().paths()
        );
    }
}
