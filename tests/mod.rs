//! Main test module for archman
//!
//! This module includes all test suites:
//! - Integration tests for complete workflows
//! - Corruption tests for damage detection
//! - Property-based tests for invariants

pub mod integration;
pub mod corruption;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::archman::*;
    use std::fs;
    use std::path::Path;

    use crate::integration::ArchiveTestHarness;

    #[test]
    fn test_special_filenames() {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("src");
        fs::create_dir(&src).unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
        ];
        for name in &special_names {
            fs::write(src.join(name), format!("Content of {}", name)).unwrap();
        }

        let root = harness.root.clone();
        harness.archive.add_dir(&src, &root.join("special")).unwrap();
        harness.archive.commit().unwrap();
        harness.archive.check().unwrap();

        for name in &special_names {
            let rel = Path::new("special").join(name);
            assert!(harness.archive.index().file_from_path(&rel).is_ok(), "{} not indexed", name);
        }
    }

    #[test]
    fn test_unicode_filenames() {
        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("src");
        fs::create_dir(&src).unwrap();

        let unicode_names = vec![
            "файл.txt",     // Russian
            "文件.txt",     // Chinese
            "ファイル.txt", // Japanese
            "αρχείο.txt",   // Greek
            "🚀🌟💾.txt",   // Emojis
        ];

        let mut created = Vec::new();
        for name in &unicode_names {
            if fs::write(src.join(name), format!("Unicode content: {}", name)).is_ok() {
                created.push(*name);
            }
        }
        if created.is_empty() {
            // No unicode support on this filesystem
            return;
        }

        let root = harness.root.clone();
        harness.archive.add_dir(&src, &root.join("unicode")).unwrap();
        harness.archive.commit().unwrap();
        harness.reopen();
        harness.archive.check().unwrap();

        let out = harness.outside("out");
        harness.archive.export_dir(&root.join("unicode"), &out).unwrap();
        for name in &created {
            let content = fs::read_to_string(out.join(name)).unwrap();
            assert_eq!(content, format!("Unicode content: {}", name));
        }
    }

    #[test]
    fn test_empty_file() {
        let mut harness = ArchiveTestHarness::new();
        let empty = harness.outside("empty");
        fs::write(&empty, b"").unwrap();
        let root = harness.root.clone();

        harness.archive.add_file(&empty, &root.join("empty")).unwrap();
        let (_, record) = harness.archive.index().file_from_path(Path::new("empty")).unwrap();
        assert_eq!(record.digest, utils::digest_bytes(b""));
        harness.archive.check().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_modes_recorded() {
        use std::os::unix::fs::PermissionsExt;

        let mut harness = ArchiveTestHarness::new();
        let src = harness.outside("src");
        fs::create_dir(&src).unwrap();
        let files = vec![
            ("readable.txt", 0o644),
            ("executable.sh", 0o755),
            ("readonly.txt", 0o444),
            ("useronly.txt", 0o600),
        ];
        for (name, mode) in &files {
            let path = src.join(name);
            fs::write(&path, format!("Content of {}", name)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).unwrap();
        }

        let root = harness.root.clone();
        harness.archive.add_dir(&src, &root.join("modes")).unwrap();

        for (name, mode) in &files {
            let (_, record) = harness
                .archive
                .index()
                .file_from_path(&Path::new("modes").join(name))
                .unwrap();
            assert_eq!(record.mode, *mode, "mode of {}", name);
        }

        let out = harness.outside("out");
        harness.archive.export_dir(&root.join("modes"), &out).unwrap();
        for (name, mode) in &files {
            let actual = fs::metadata(out.join(name)).unwrap().permissions().mode() & 0o777;
            assert_eq!(actual, *mode, "exported mode of {}", name);
        }
    }

    #[test]
    fn test_same_name_rejected() {
        let mut harness = ArchiveTestHarness::new();
        let f = harness.outside("f");
        fs::write(&f, b"x").unwrap();
        let d = harness.outside("d");
        fs::create_dir(&d).unwrap();
        let root = harness.root.clone();

        harness.archive.add_file(&f, &root.join("name")).unwrap();
        let err = harness.archive.add_dir(&d, &root.join("name")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        harness.archive.check().unwrap();
    }

    #[test]
    fn test_operations_outside_archive_rejected() {
        let mut harness = ArchiveTestHarness::new();
        let f = harness.outside("f");
        fs::write(&f, b"x").unwrap();

        let err = harness.archive.delete_file(&f).unwrap_err();
        assert!(matches!(err, ArchiveError::NotInArchive(_)));
        let err = harness.archive.move_file(&f, &harness.outside("g")).unwrap_err();
        assert!(matches!(err, ArchiveError::NotInArchive(_)));
    }
}
