//! Chaos testing for modvault
//!
//! Injects the failures a real destination sees (sources vanishing mid-copy,
//! damaged backups, junk in the backup root, competing callers) and checks
//! the destination always ends up either fully installed or untouched.

use super::{snapshot, Workspace, ZIP_LEVELS};
use ::modvault::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{info, warn};
use tracing_test::traced_test;
use zip::write::SimpleFileOptions;

/// Deterministic generator of random package trees
pub struct ChaosEngine {
    rng: StdRng,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Random relative file paths with random content
    pub fn tree(&mut self, files: usize) -> Vec<(String, Vec<u8>)> {
        let mut tree: Vec<(String, Vec<u8>)> = Vec::with_capacity(files);
        while tree.len() < files {
            let depth = self.rng.random_range(0..3);
            let mut path = String::new();
            for _ in 0..depth {
                path.push_str(&format!("d{}/", self.rng.random_range(0..3)));
            }
            path.push_str(&format!("f{}.dat", self.rng.random_range(0..8)));
            if tree.iter().any(|(existing, _)| *existing == path) {
                continue;
            }
            let mut content = vec![0u8; self.rng.random_range(0..4096)];
            self.rng.fill(&mut content[..]);
            tree.push((path, content));
        }
        tree
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.rng.random_range(0..items.len())]
    }
}

fn as_files(tree: &[(String, Vec<u8>)]) -> Vec<(&str, &[u8])> {
    tree.iter().map(|(p, c)| (p.as_str(), c.as_slice())).collect()
}

/// Replace one entry of a zip store, copying the rest untouched
fn rewrite_zip_entry(store: &Path, name: &str, content: &[u8]) -> anyhow::Result<()> {
    let mut source = zip::ZipArchive::new(File::open(store)?)?;
    let rebuilt = store.with_extension("rebuilt");
    let mut writer = zip::ZipWriter::new(File::create(&rebuilt)?);
    for index in 0..source.len() {
        let entry = source.by_index_raw(index)?;
        if entry.name() == name {
            drop(entry);
            writer.start_file(name, SimpleFileOptions::default())?;
            writer.write_all(content)?;
        } else {
            writer.raw_copy_file(entry)?;
        }
    }
    writer.finish()?;
    drop(source);
    fs::rename(&rebuilt, store)?;
    Ok(())
}

/// Overwrite a preserved file inside a store of either layout
fn tamper(store: &Path, relative: &str, content: &[u8]) -> anyhow::Result<()> {
    if store.is_dir() {
        fs::write(store.join("files").join(relative), content)?;
        Ok(())
    } else {
        rewrite_zip_entry(store, &format!("files/{}", relative), content)
    }
}

#[test]
#[traced_test]
fn test_source_vanishes_mid_install() {
    let mut chaos = ChaosEngine::new(7);
    for level in ZIP_LEVELS {
        let ws = Workspace::new();
        let tree = chaos.tree(12);
        let existing = chaos.tree(6);
        for (path, content) in &existing {
            ws.write_dest(path, content);
        }
        let source = ws.add_source("Fragile", &as_files(&tree));
        let before = snapshot(&ws.dest());

        let location = ws.open(level);
        let id = location.find("Fragile").unwrap();
        let victim = location
            .get(id)
            .unwrap()
            .source()
            .unwrap()
            .items
            .files()
            .last()
            .unwrap()
            .path
            .clone();

        let err = location
            .install(id, |info| {
                if info.processed == 1 {
                    fs::remove_file(source.join(&victim)).unwrap();
                }
                true
            })
            .unwrap_err();

        match &err {
            ModvaultError::SourceUnavailable { path, .. } => assert_eq!(path, &victim),
            other => panic!("unexpected error at level {}: {}", level, other),
        }
        assert!(err.is_fatal());
        assert_eq!(snapshot(&ws.dest()), before, "level {}", level);
        assert!(!location.get(id).unwrap().is_installed());
        assert!(BackupStore::locate(&ws.backups(), "Fragile").is_none());
        info!("Rolled back vanished source at level {}", level);
    }
}

#[test]
fn test_archive_source_replaced_mid_install() {
    let ws = Workspace::new();
    ws.write_dest("a.txt", "OLD");
    let archive = ws.add_archive("Packed.zip", &[("a.txt", "NEW"), ("b/c.txt", "C"), ("d.txt", "D")]);
    let before = snapshot(&ws.dest());
    let location = ws.open(0);
    let id = location.find("Packed").unwrap();

    let err = location
        .install(id, |info| {
            if info.processed == 1 {
                fs::write(&archive, b"not a zip any more").unwrap();
            }
            true
        })
        .unwrap_err();

    assert!(matches!(err, ModvaultError::SourceUnavailable { .. }), "{}", err);
    assert_eq!(snapshot(&ws.dest()), before);
}

#[test]
#[traced_test]
fn test_corrupt_backup_entry_then_retry() {
    for level in ZIP_LEVELS {
        let ws = Workspace::new();
        ws.write_dest("a.txt", "OLD");
        ws.write_dest("keep/b.txt", "OLD B");
        ws.add_source("Mod", &[("a.txt", "NEW"), ("keep/b.txt", "NEW B"), ("c.txt", "C")]);
        let before = snapshot(&ws.dest());
        let location = ws.open(level);
        let id = location.find("Mod").unwrap();
        let report = location.install(id, |_| true).unwrap();

        tamper(&report.backup_path, "a.txt", b"GARBAGE").unwrap();
        let err = location.uninstall(id, |_| true).unwrap_err();
        match &err {
            ModvaultError::PartialRestore { failures } => {
                assert_eq!(failures.len(), 1, "level {}", level);
                assert_eq!(failures[0].path, Path::new("a.txt"));
            }
            other => panic!("unexpected error at level {}: {}", level, other),
        }
        assert!(err.is_recoverable());

        // The corrupt entry never reaches the destination
        assert_eq!(ws.read_dest("a.txt"), b"NEW");
        assert_eq!(ws.read_dest("keep/b.txt"), b"OLD B");
        assert!(!ws.dest().join("c.txt").exists());

        let package = location.get(id).unwrap();
        assert!(package.is_installed());
        assert_eq!(package.backup().unwrap().items.len(), 1);

        tamper(&report.backup_path, "a.txt", b"OLD").unwrap();
        location.uninstall(id, |_| true).unwrap();
        assert_eq!(snapshot(&ws.dest()), before, "level {}", level);
        assert!(!report.backup_path.exists());
    }
}

#[test]
#[traced_test]
fn test_garbage_in_backup_root_is_skipped() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.backups().join("Broken")).unwrap();
    fs::write(ws.backups().join("Broken/backup.json"), "{ not json").unwrap();
    fs::create_dir_all(ws.backups().join(".staging-leftover/files")).unwrap();
    let mut noise = vec![0u8; 512];
    StdRng::seed_from_u64(3).fill(&mut noise[..]);
    fs::write(ws.backups().join("Junk.zip"), &noise).unwrap();
    fs::write(ws.backups().join("notes.txt"), "not a store").unwrap();

    ws.add_source("Good", &[("good.txt", "G")]);
    ws.add_source("Junk", &[("junk.txt", "J")]);
    let location = ws.open(6);

    assert_eq!(location.packages().len(), 2);
    assert!(location.installed().is_empty());

    let good = location.find("Good").unwrap();
    location.install(good, |_| true).unwrap();
    location.uninstall(good, |_| true).unwrap();

    // A store-shaped file squatting on the package's backup name blocks the install
    let junk = location.find("Junk").unwrap();
    let err = location.install(junk, |_| true).unwrap_err();
    assert!(matches!(err, ModvaultError::BackupExists(_)), "{}", err);
    assert!(!ws.dest().join("junk.txt").exists());
    assert_eq!(fs::read(ws.backups().join("Junk.zip")).unwrap(), noise);
}

#[test]
fn test_destination_changed_between_install_and_uninstall() {
    let ws = Workspace::new();
    ws.add_source("Mod", &[("a.txt", "A"), ("sub/b.txt", "B"), ("sub/deep/c.txt", "C")]);
    let location = ws.open(-1);
    let id = location.find("Mod").unwrap();
    location.install(id, |_| true).unwrap();

    // The user already removed part of what the package installed
    fs::remove_dir_all(ws.dest().join("sub/deep")).unwrap();
    fs::remove_file(ws.dest().join("a.txt")).unwrap();

    let report = location.uninstall(id, |_| true).unwrap();
    assert_eq!(report.files_deleted, 1);
    assert!(snapshot(&ws.dest()).is_empty());
}

#[test]
fn test_random_packages_stack_and_unstack() {
    let mut chaos = ChaosEngine::new(42);
    for level in ZIP_LEVELS {
        let ws = Workspace::new();
        for (path, content) in chaos.tree(10) {
            ws.write_dest(&path, content);
        }
        let names: Vec<String> = (0..4).map(|i| format!("Random {}", i)).collect();
        for name in &names {
            let tree = chaos.tree(8);
            ws.add_source(name, &as_files(&tree));
        }
        let before = snapshot(&ws.dest());
        let location = ws.open(level);

        let mut order: Vec<Identity> = names.iter().map(|n| location.find(n).unwrap()).collect();
        let first = *chaos.pick(&order);
        order.retain(|id| *id != first);
        order.insert(0, first);

        for id in &order {
            let report = location.install(*id, |_| true).unwrap();
            if !report.overlaps.is_empty() {
                warn!("{} overlaps {:?}", id, report.overlaps);
            }
        }
        for id in order.iter().rev() {
            location.uninstall(*id, |_| true).unwrap();
        }
        assert_eq!(snapshot(&ws.dest()), before, "level {}", level);
    }
}

#[test]
fn test_busy_package_rejects_second_caller() {
    let ws = Workspace::new();
    ws.add_source("Slow", &[("a.txt", "A"), ("b.txt", "B")]);
    let location = ws.open(-1);
    let id = location.find("Slow").unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    thread::scope(|scope| {
        let worker = scope.spawn(|| {
            location.install(id, move |info| {
                if info.processed == 1 {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
                true
            })
        });

        started_rx.recv().unwrap();
        assert!(location.is_busy(id));
        assert!(matches!(location.install(id, |_| true), Err(ModvaultError::PackageBusy(_))));
        assert!(matches!(location.uninstall(id, |_| true), Err(ModvaultError::PackageBusy(_))));
        assert!(matches!(location.discard_backup(id), Err(ModvaultError::PackageBusy(_))));
        location.refresh().unwrap();
        release_tx.send(()).unwrap();

        worker.join().unwrap().unwrap();
    });

    assert!(!location.is_busy(id));
    assert!(location.get(id).unwrap().is_installed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_spawns_on_distinct_packages() {
    let ws = Workspace::new();
    let mut chaos = ChaosEngine::new(11);
    let names: Vec<String> = (0..6).map(|i| format!("Parallel {}", i)).collect();
    for (i, name) in names.iter().enumerate() {
        let tree: Vec<(String, Vec<u8>)> = chaos
            .tree(5)
            .into_iter()
            .map(|(path, content)| (format!("p{}/{}", i, path), content))
            .collect();
        ws.add_source(name, &as_files(&tree));
    }
    let location = Arc::new(ws.open(1));
    let ids: Vec<Identity> = names.iter().map(|n| location.find(n).unwrap()).collect();

    let mut handles = Vec::new();
    for id in &ids {
        handles.push(location.spawn_install(*id, CancelToken::new(), None).unwrap());
    }
    match location.spawn_install(ids[0], CancelToken::new(), None) {
        Err(ModvaultError::PackageBusy(_)) => {}
        // The first install already finished
        Ok(late) => assert!(matches!(late.wait().await, Err(ModvaultError::AlreadyInstalled(_)))),
        Err(other) => panic!("unexpected error: {}", other),
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert_eq!(location.installed().len(), ids.len());

    let mut handles = Vec::new();
    for id in &ids {
        handles.push(location.spawn_uninstall(*id, CancelToken::new(), None).unwrap());
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }
    assert!(snapshot(&ws.dest()).is_empty());
    let leftovers: Vec<PathBuf> = fs::read_dir(ws.backups())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}
