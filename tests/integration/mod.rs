//! End-to-end integration tests for modvault
//!
//! Drives whole install/uninstall cycles through a Location against real
//! temporary directories, in every backup mode.

use super::{snapshot, Workspace, ZIP_LEVELS};
use ::modvault::*;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::info;
use tracing_test::traced_test;

#[test]
#[traced_test]
fn test_empty_destination_round_trip() {
    for level in ZIP_LEVELS {
        let ws = Workspace::new();
        ws.add_source("Mod", &[("a.txt", "A"), ("sub/b.txt", "B")]);
        let location = ws.open(level);
        let id = location.find("Mod").unwrap();

        let footprint = location.get(id).unwrap().footprint(&ws.dest()).unwrap();
        for path in ["a.txt", "sub", "sub/b.txt"] {
            assert_eq!(
                footprint.get(Path::new(path)).unwrap().disposition,
                ItemDisposition::DeleteOnUninstall,
                "{} at level {}",
                path,
                level
            );
        }

        let report = location.install(id, |_| true).unwrap();
        assert_eq!(report.files_installed, 2);
        assert_eq!(report.files_backed_up, 0);
        assert_eq!(ws.read_dest("sub/b.txt"), b"B");

        let report = location.uninstall(id, |_| true).unwrap();
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.directories_removed, 1);
        assert!(snapshot(&ws.dest()).is_empty(), "level {}", level);
        info!("Empty destination scenario passed at level {}", level);
    }
}

#[test]
fn test_overwrite_round_trip() {
    for level in ZIP_LEVELS {
        let ws = Workspace::new();
        ws.write_dest("a.txt", "OLD");
        ws.add_source("Mod", &[("a.txt", "NEW")]);
        let location = ws.open(level);
        let id = location.find("Mod").unwrap();

        let footprint = location.get(id).unwrap().footprint(&ws.dest()).unwrap();
        assert_eq!(
            footprint.get(Path::new("a.txt")).unwrap().disposition,
            ItemDisposition::CopyOverwrite
        );

        let report = location.install(id, |_| true).unwrap();
        assert_eq!(ws.read_dest("a.txt"), b"NEW");
        assert_eq!(report.files_backed_up, 1);
        assert_eq!(preserved_content(&report.backup_path, "a.txt"), b"OLD");

        location.uninstall(id, |_| true).unwrap();
        assert_eq!(ws.read_dest("a.txt"), b"OLD");
        assert!(!report.backup_path.exists());
    }
}

/// Content of a preserved file inside a store of either layout
fn preserved_content(store: &Path, relative: &str) -> Vec<u8> {
    if store.is_dir() {
        fs::read(store.join("files").join(relative)).unwrap()
    } else {
        let mut archive = zip::ZipArchive::new(fs::File::open(store).unwrap()).unwrap();
        let mut entry = archive.by_name(&format!("files/{}", relative)).unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        content
    }
}

#[test]
#[traced_test]
fn test_shared_file_overlap() {
    for level in ZIP_LEVELS {
        let ws = Workspace::new();
        ws.add_source("P", &[("shared.cfg", "from P"), ("p.txt", "p")]);
        ws.add_source("Q", &[("shared.cfg", "from Q"), ("q.txt", "q")]);
        let location = ws.open(level);
        let p = location.find("P").unwrap();
        let q = location.find("Q").unwrap();

        location.install(p, |_| true).unwrap();
        assert_eq!(location.overlapping(q).unwrap().into_iter().collect::<Vec<_>>(), vec![p]);

        let report = location.install(q, |_| true).unwrap();
        assert!(report.overlaps.contains(&p));
        assert!(location.get(q).unwrap().overlaps().unwrap().contains(&p));
        assert!(location.get(p).unwrap().overlaps().unwrap().is_empty());
        assert_eq!(ws.read_dest("shared.cfg"), b"from Q");

        location.uninstall(q, |_| true).unwrap();
        assert_eq!(ws.read_dest("shared.cfg"), b"from P");
        assert!(!ws.dest().join("q.txt").exists());

        location.uninstall(p, |_| true).unwrap();
        assert!(snapshot(&ws.dest()).is_empty());
    }
}

#[test]
fn test_overlap_is_directional() {
    let ws = Workspace::new();
    ws.write_dest("base.cfg", "vanilla");
    ws.add_source("P", &[("base.cfg", "P")]);
    ws.add_source("Q", &[("base.cfg", "Q"), ("extra.cfg", "Q")]);
    let location = ws.open(-1);
    let p_id = location.find("P").unwrap();
    location.install(p_id, |_| true).unwrap();

    let p = location.get(p_id).unwrap();
    let q = location.get(location.find("Q").unwrap()).unwrap();
    let q_footprint = q.footprint(&ws.dest()).unwrap();
    let p_footprint = p.footprint(&ws.dest()).unwrap();

    assert!(detect_overlap(&q_footprint, &p.backup().unwrap().items, PathCase::Sensitive));
    assert!(q.overlaps_with(&p, &ws.dest(), PathCase::Sensitive).unwrap());
    // Q has no backup, so the reverse question has nothing to collide with
    assert!(!p.overlaps_with(&q, &ws.dest(), PathCase::Sensitive).unwrap());
    assert!(!detect_overlap(&p_footprint, &ItemSet::new(), PathCase::Sensitive));
}

#[test]
#[traced_test]
fn test_rename_breaks_identity_link() {
    let ws = Workspace::new();
    let archive = ws.add_archive("Mod.zip", &[("a.txt", "A")]);
    let location = ws.open(6);
    let old_id = location.find("Mod").unwrap();
    location.install(old_id, |_| true).unwrap();

    let renamed = ws.library().join("Mod Renamed.zip");
    fs::rename(&archive, &renamed).unwrap();
    let new_id = Identity::from_path(&renamed).unwrap();
    assert_ne!(new_id, old_id);

    location.refresh().unwrap();
    assert_eq!(location.get(old_id).unwrap().side(), Some(PackageSide::BackupOnly));
    assert_eq!(location.get(new_id).unwrap().side(), Some(PackageSide::SourceOnly));

    // The old backup cannot be attached to the renamed source
    let old_backup = location.get(old_id).unwrap().backup().unwrap().clone();
    let mut renamed_package = Package::from_source(&renamed).unwrap();
    assert!(matches!(
        renamed_package.attach_backup(old_backup.clone()),
        Err(ModvaultError::IdentityMismatch { .. })
    ));

    // Renaming the store to match the new name leaves the old identity without a backup
    let mut old_package = location.get(old_id).unwrap();
    fs::rename(&old_backup.path, ws.backups().join("Mod Renamed.zip")).unwrap();
    assert!(!old_package.revalidate_backup());
    assert_eq!(old_package.side(), None);

    location.refresh().unwrap();
    assert!(location.get(old_id).is_none());
    assert_eq!(location.get(new_id).unwrap().side(), Some(PackageSide::Both));
    location.uninstall(new_id, |_| true).unwrap();
    assert!(snapshot(&ws.dest()).is_empty());
}

#[test]
fn test_archive_install_matches_folder_install() {
    let files = [("data/meshes/tree.nif", "mesh"), ("data/tree.esp", "esp"), ("readme.txt", "hi")];

    let folder_ws = Workspace::new();
    folder_ws.add_source("Trees", &files);
    let folder_location = folder_ws.open(-1);
    folder_location
        .install(folder_location.find("Trees").unwrap(), |_| true)
        .unwrap();

    let archive_ws = Workspace::new();
    archive_ws.add_archive("Trees.zip", &files);
    let archive_location = archive_ws.open(9);
    archive_location
        .install(archive_location.find("Trees").unwrap(), |_| true)
        .unwrap();

    assert_eq!(snapshot(&folder_ws.dest()), snapshot(&archive_ws.dest()));
}

#[test]
fn test_existing_directories_survive_uninstall() {
    let ws = Workspace::new();
    ws.write_dest("data/vanilla.esm", "vanilla");
    ws.add_source("Mod", &[("data/mod.esp", "mod"), ("data/textures/t.dds", "t")]);
    let location = ws.open(0);
    let id = location.find("Mod").unwrap();
    let before = snapshot(&ws.dest());

    location.install(id, |_| true).unwrap();
    ws.write_dest("data/textures/user.dds", "user");
    let report = location.uninstall(id, |_| true).unwrap();

    assert_eq!(report.directories_kept, 1);
    assert_eq!(ws.read_dest("data/vanilla.esm"), b"vanilla");
    assert_eq!(ws.read_dest("data/textures/user.dds"), b"user");

    fs::remove_file(ws.dest().join("data/textures/user.dds")).unwrap();
    fs::remove_dir(ws.dest().join("data/textures")).unwrap();
    assert_eq!(snapshot(&ws.dest()), before);
}

#[test]
fn test_discard_keeps_installed_files() {
    let ws = Workspace::new();
    ws.write_dest("a.txt", "OLD");
    ws.add_source("Mod", &[("a.txt", "NEW")]);
    let location = ws.open(6);
    let id = location.find("Mod").unwrap();

    location.install(id, |_| true).unwrap();
    location.discard_backup(id).unwrap();

    assert_eq!(ws.read_dest("a.txt"), b"NEW");
    assert_eq!(location.get(id).unwrap().side(), Some(PackageSide::SourceOnly));
    assert!(BackupStore::locate(&ws.backups(), "Mod").is_none());
}

#[test]
fn test_backup_only_package_survives_restart() {
    let ws = Workspace::new();
    ws.write_dest("a.txt", "OLD");
    let source = ws.add_source("Mod", &[("a.txt", "NEW"), ("b.txt", "B")]);
    {
        let location = ws.open(-1);
        location.install(location.find("Mod").unwrap(), |_| true).unwrap();
    }
    fs::remove_dir_all(source).unwrap();

    let location = ws.open(-1);
    let id = location.find("Mod").unwrap();
    let package = location.get(id).unwrap();
    assert_eq!(package.side(), Some(PackageSide::BackupOnly));
    assert!(matches!(
        package.footprint(&ws.dest()),
        Err(ModvaultError::MissingSource(_))
    ));

    location.uninstall(id, |_| true).unwrap();
    assert_eq!(ws.read_dest("a.txt"), b"OLD");
    assert!(!ws.dest().join("b.txt").exists());
    assert!(location.packages().is_empty());
}

#[test]
fn test_progress_reports_every_item() {
    let ws = Workspace::new();
    ws.add_source("Mod", &[("a.txt", "A"), ("sub/b.txt", "B"), ("sub/c.txt", "C")]);
    let location = ws.open(1);
    let id = location.find("Mod").unwrap();

    let mut seen = Vec::new();
    location
        .install(id, |info| {
            assert_eq!(info.operation, "install");
            assert_eq!(info.total, 4);
            seen.push(info.processed);
            true
        })
        .unwrap();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    let mut items = Vec::new();
    location
        .uninstall(id, |info| {
            if let Some(item) = &info.current_item {
                items.push(item.clone());
            }
            true
        })
        .unwrap();
    assert_eq!(items.first().map(|p| p.as_path()), Some(Path::new("sub/c.txt")));
    assert_eq!(items.last().map(|p| p.as_path()), Some(Path::new("a.txt")));
}
