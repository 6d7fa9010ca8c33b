//! Main test module for modvault
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end install/uninstall scenarios
//! - Chaos tests for failure injection and recovery
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;

use ::modvault::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Every backup mode worth exercising: folder, stored zip, deflated zip
pub const ZIP_LEVELS: [i32; 3] = [-1, 0, 6];

/// Relative path to file content (`None` for directories)
pub type Tree = BTreeMap<PathBuf, Option<Vec<u8>>>;

/// Capture a directory tree byte for byte
pub fn snapshot(root: &Path) -> Tree {
    if !root.exists() {
        return Tree::new();
    }
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            let content = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
            (relative, content)
        })
        .collect()
}

/// Library, destination and backup root under one temporary directory
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("library")).unwrap();
        fs::create_dir_all(dir.path().join("game")).unwrap();
        Self { dir }
    }

    pub fn library(&self) -> PathBuf {
        self.dir.path().join("library")
    }

    pub fn dest(&self) -> PathBuf {
        self.dir.path().join("game")
    }

    pub fn backups(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    /// Create a folder package
    pub fn add_source<C: AsRef<[u8]>>(&self, name: &str, files: &[(&str, C)]) -> PathBuf {
        let root = self.library().join(name);
        fs::create_dir_all(&root).unwrap();
        for (path, content) in files {
            let file = root.join(path);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, content).unwrap();
        }
        root
    }

    /// Create an archive package; `file_name` includes the extension
    pub fn add_archive<C: AsRef<[u8]>>(&self, file_name: &str, files: &[(&str, C)]) -> PathBuf {
        let path = self.library().join(file_name);
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, content) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_ref()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    /// Put a file in the destination
    pub fn write_dest(&self, relative: &str, content: impl AsRef<[u8]>) {
        let file = self.dest().join(relative);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, content).unwrap();
    }

    pub fn read_dest(&self, relative: &str) -> Vec<u8> {
        fs::read(self.dest().join(relative)).unwrap()
    }

    pub fn open(&self, zip_level: i32) -> Location {
        LocationBuilder::new()
            .name("test")
            .zip_level(zip_level)
            .case(PathCase::Sensitive)
            .build(self.library(), self.dest(), self.backups())
            .unwrap()
    }

    /// Target for driving a [`Package`] directly
    pub fn target(&self, zip_level: i32) -> InstallTarget {
        InstallTarget {
            destination: self.dest(),
            backup_root: self.backups(),
            mode: BackupMode::from_zip_level(zip_level).unwrap(),
            case: PathCase::Sensitive,
        }
    }
}

#[cfg(test)]
mod edge_cases {
    use super::*;

    #[test]
    fn test_empty_package() {
        let ws = Workspace::new();
        ws.add_source("Empty", &[] as &[(&str, &str)]);
        let location = ws.open(6);
        let id = location.find("Empty").unwrap();

        let report = location.install(id, |_| true).unwrap();
        assert_eq!(report.files_installed, 0);
        assert!(location.get(id).unwrap().is_installed());

        location.uninstall(id, |_| true).unwrap();
        assert!(snapshot(&ws.dest()).is_empty());
    }

    #[test]
    fn test_ozp_archive_and_dotted_names() {
        let ws = Workspace::new();
        ws.add_archive("Mod.v2.ozp", &[("data/mod.esp", "esp")]);
        ws.add_source("Other.v3", &[("other.txt", "o")]);
        let location = ws.open(0);

        let archived = location.find("Mod.v2").unwrap();
        let folder = location.find("Other.v3").unwrap();
        assert_eq!(archived, Identity::from_name("Mod.v2"));
        assert_eq!(folder, Identity::from_name("Other.v3"));

        location.install(archived, |_| true).unwrap();
        location.install(folder, |_| true).unwrap();
        assert_eq!(ws.read_dest("data/mod.esp"), b"esp");
        assert!(ws.backups().join("Mod.v2.zip").is_file());
        assert!(ws.backups().join("Other.v3.zip").is_file());

        let reopened = ws.open(0);
        assert_eq!(reopened.installed().len(), 2);
    }

    #[test]
    fn test_unicode_and_spaces() {
        let ws = Workspace::new();
        ws.add_source("Ünïcödé Pack", &[("папка/файл 1.txt", "привет")]);
        let location = ws.open(-1);
        let id = location.find("Ünïcödé Pack").unwrap();

        location.install(id, |_| true).unwrap();
        assert_eq!(ws.read_dest("папка/файл 1.txt"), "привет".as_bytes());
        location.uninstall(id, |_| true).unwrap();
        assert!(snapshot(&ws.dest()).is_empty());
    }

    #[test]
    fn test_missing_destination_root() {
        let ws = Workspace::new();
        fs::remove_dir_all(ws.dest()).unwrap();
        ws.add_source("Mod", &[("a.txt", "A")]);
        let location = ws.open(-1);
        let id = location.find("Mod").unwrap();

        let footprint = location.get(id).unwrap().footprint(&ws.dest()).unwrap();
        assert!(footprint.iter().all(|e| e.disposition == ItemDisposition::DeleteOnUninstall));

        location.install(id, |_| true).unwrap();
        assert_eq!(ws.read_dest("a.txt"), b"A");
        location.uninstall(id, |_| true).unwrap();
        assert!(snapshot(&ws.dest()).is_empty());
    }

    #[test]
    fn test_invalid_zip_level_is_rejected() {
        let ws = Workspace::new();
        let err = LocationBuilder::new()
            .zip_level(12)
            .build(ws.library(), ws.dest(), ws.backups())
            .unwrap_err();
        assert!(matches!(err, ModvaultError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_unknown_package() {
        let ws = Workspace::new();
        let location = ws.open(-1);
        let ghost = Identity::from_name("Ghost");
        assert!(matches!(
            location.install(ghost, |_| true),
            Err(ModvaultError::PackageNotFound(_))
        ));
        assert!(location.find("Ghost").is_none());
    }
}
