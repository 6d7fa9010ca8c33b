//! Source scanning and footprint computation
//!
//! A package source is either a folder or a zip archive whose layout mirrors
//! the destination tree. Scanning turns it into an [`ItemSet`] in install
//! order; [`compute_footprint`] then simulates installing that set against the
//! live destination and assigns each entry its disposition without touching
//! the filesystem.

use crate::error::{ModvaultError, Result};
use crate::types::{Footprint, ItemDisposition, ItemEntry, ItemKind, ItemSet};
use crate::utils;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Scan a folder source
///
/// Every file and directory below `root` becomes an entry; `root` itself does
/// not. Symbolic links are followed only as far as their metadata says file
/// or directory; anything else is skipped.
pub fn scan_folder(root: &Path) -> Result<ItemSet> {
    if !root.is_dir() {
        return Err(ModvaultError::InvalidPackage(format!(
            "{:?} is not a directory",
            root
        )));
    }

    let mut items = ItemSet::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = utils::make_relative(entry.path(), root)?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            items.push(ItemEntry::directory(relative));
        } else if file_type.is_file() {
            items.push(ItemEntry::file(relative));
        } else {
            trace!("Skipping non-regular entry {:?}", entry.path());
        }
    }
    items.sort_install_order();
    debug!("Scanned folder {:?}: {} entries", root, items.len());
    Ok(items)
}

/// Scan a zip archive source
///
/// Entries keep their central directory index so install can extract them
/// directly. Parent directories missing from the archive are added
/// implicitly, without an index. Entries whose names would escape the
/// destination root are skipped.
pub fn scan_archive(path: &Path) -> Result<ItemSet> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let mut entries: BTreeMap<PathBuf, ItemEntry> = BTreeMap::new();

    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        let Some(relative) = file.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!("Skipping unsafe archive entry {:?} in {:?}", file.name(), path);
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        for ancestor in relative.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            entries
                .entry(ancestor.to_path_buf())
                .or_insert_with(|| ItemEntry::directory(ancestor));
        }

        let entry = if file.is_dir() {
            ItemEntry::directory(&relative)
        } else {
            ItemEntry::file(&relative)
        };
        entries.insert(relative, entry.with_zip_index(index));
    }

    let mut items: ItemSet = entries.into_values().collect();
    items.sort_install_order();
    debug!("Scanned archive {:?}: {} entries", path, items.len());
    Ok(items)
}

/// Simulate installing `source` into `destination`
///
/// Files that already exist become `CopyOverwrite`, missing ones
/// `DeleteOnUninstall`. Missing directories become `DeleteOnUninstall`;
/// existing ones are left at `None` and survive uninstall. A missing
/// destination root just means nothing exists yet.
///
/// The result depends only on `source` and the current state of the
/// destination, so two calls against an unchanged tree are equal.
pub fn compute_footprint(source: &ItemSet, destination: &Path) -> Footprint {
    let mut footprint: Footprint = source
        .iter()
        .map(|entry| {
            let exists = fs::symlink_metadata(destination.join(&entry.path)).is_ok();
            let disposition = match (entry.kind, exists) {
                (ItemKind::File, true) => ItemDisposition::CopyOverwrite,
                (ItemKind::File, false) => ItemDisposition::DeleteOnUninstall,
                (ItemKind::Directory, true) => ItemDisposition::None,
                (ItemKind::Directory, false) => ItemDisposition::DeleteOnUninstall,
            };
            ItemEntry {
                disposition,
                ..entry.clone()
            }
        })
        .collect();
    footprint.sort_install_order();
    footprint
}
