//! Property-based testing for archman
//!
//! Uses proptest to check the archive's round-trip and bookkeeping
//! guarantees across randomly generated content and trees.

use ::archman::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::integration::{snapshot_tree, ArchiveTestHarness};

/// Generate file contents, empty included
fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(Vec::new()),
        prop::collection::vec(any::<u8>(), 1..64),
        prop::collection::vec(any::<u8>(), 1024..8192),
    ]
}

/// Generate file names that are valid on every platform
fn name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{1,10}",
        "file[0-9]{1,3}\\.(txt|rs|md)",
        "[a-z]{2,6} [a-z]{2,6}",
    ]
}

/// Generate small trees: relative path → content
fn tree_strategy() -> impl Strategy<Value = BTreeMap<PathBuf, Vec<u8>>> {
    let path = (prop::collection::vec("dir[0-9]", 0..3), name_strategy()).prop_map(|(dirs, name)| {
        let mut path: PathBuf = dirs.into_iter().collect();
        path.push(format!("f_{}", name));
        path
    });
    prop::collection::btree_map(path, content_strategy(), 1..20)
}

fn write_tree(base: &Path, tree: &BTreeMap<PathBuf, Vec<u8>>) {
    fs::create_dir_all(base).unwrap();
    for (rel, content) in tree {
        let path = base.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Adding then exporting a file reproduces its bytes
    #[test]
    fn add_export_file_identity(content in content_strategy(), name in name_strategy()) {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("source");
        fs::write(&src, &content).unwrap();
        let out = harness.outside("exported");
        let dst = harness.root.join(&name);

        harness.archive.add_file(&src, &dst).unwrap();
        harness.archive.export_file(&dst, &out).unwrap();

        prop_assert_eq!(fs::read(&out).unwrap(), content);
        prop_assert!(harness.archive.check().is_ok());
    }

    /// Adding then exporting a tree reproduces every file and folder
    #[test]
    fn add_export_dir_identity(tree in tree_strategy()) {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("source");
        write_tree(&src, &tree);
        let out = harness.outside("exported");
        let root = harness.root.clone();

        harness.archive.add_dir(&src, &root.join("tree")).unwrap();
        harness.archive.commit().unwrap();
        harness.reopen();
        harness.archive.export_dir(&root.join("tree"), &out).unwrap();

        prop_assert_eq!(snapshot_tree(&src), snapshot_tree(&out));
    }

    /// Moving a file changes only its location
    #[test]
    fn move_keeps_record(content in content_strategy(), from in name_strategy(), to in name_strategy()) {
        prop_assume!(from != to);
        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("source");
        fs::write(&src, &content).unwrap();
        let root = harness.root.clone();

        harness.archive.add_file(&src, &root.join(&from)).unwrap();
        let (uid, before) = harness.archive.index().file_from_path(Path::new(&from)).unwrap();
        harness.archive.move_file(&root.join(&from), &root.join(&to)).unwrap();
        let (moved, after) = harness.archive.index().file_from_path(Path::new(&to)).unwrap();

        prop_assert_eq!(uid, moved);
        prop_assert_eq!(before.digest, after.digest);
        prop_assert_eq!(before.mode, after.mode);
        prop_assert!(harness.archive.check().is_ok());
    }

    /// Updating a file gives its record the new content's digest
    #[test]
    fn update_tracks_new_content(old in content_strategy(), new in content_strategy()) {
        let mut harness = ArchiveTestHarness::new();
        let v1 = harness.outside("v1");
        let v2 = harness.outside("v2");
        fs::write(&v1, &old).unwrap();
        fs::write(&v2, &new).unwrap();
        let dst = harness.root.join("doc");

        harness.archive.add_file(&v1, &dst).unwrap();
        harness.archive.update_file(&v2, &dst).unwrap();

        let (_, record) = harness.archive.index().file_from_path(Path::new("doc")).unwrap();
        prop_assert_eq!(record.digest, utils::digest_bytes(&new));
        prop_assert!(harness.archive.check().is_ok());
    }

    /// Hard-link dedup keeps every path and collapses content to one inode per digest
    #[cfg(unix)]
    #[test]
    fn dedup_hardlink_preserves_paths(tree in tree_strategy()) {
        use std::collections::HashSet;
        use std::os::unix::fs::MetadataExt;

        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("source");
        write_tree(&src, &tree);
        let root = harness.root.clone();
        harness.archive.add_dir(&src, &root.join("tree")).unwrap();

        harness.archive.dedup(&root.join("tree"), true).unwrap();

        let before = harness.archive.index().file_count();
        prop_assert_eq!(before, tree.len());
        let inodes: HashSet<u64> = tree
            .keys()
            .map(|rel| fs::metadata(root.join("tree").join(rel)).unwrap().ino())
            .collect();
        let contents: HashSet<&Vec<u8>> = tree.values().collect();
        prop_assert_eq!(inodes.len(), contents.len());
        prop_assert!(harness.archive.check().is_ok());
    }
}
