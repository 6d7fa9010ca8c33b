//! Uninstall transaction
//!
//! Walks a backup's items backwards (files before their directories) and
//! undoes the install: preserved files are copied back, created files are
//! deleted and created directories are removed once empty. Failures do not
//! stop the walk; they are collected, and the store is rewritten to list only
//! what is still unresolved so the uninstall can simply be retried.

use crate::backup::{BackupReader, BackupStore};
use crate::error::{ModvaultError, Result, RestoreFailure};
use crate::types::{ItemDisposition, ItemEntry, ItemKind, ItemSet, ProgressInfo, UninstallReport};
use crate::utils;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// One uninstall of one backup store from one destination
#[derive(Debug)]
pub struct UninstallTransaction<'a> {
    store_path: &'a Path,
    destination: &'a Path,
}

impl<'a> UninstallTransaction<'a> {
    /// Prepare reverting the store at `store_path` from `destination`
    pub fn new(store_path: &'a Path, destination: &'a Path) -> Self {
        Self {
            store_path,
            destination,
        }
    }

    /// Run the uninstall
    ///
    /// On full success the store is deleted. Otherwise the store keeps the
    /// unresolved and unprocessed entries and the error is either
    /// [`ModvaultError::Aborted`] or [`ModvaultError::PartialRestore`].
    #[instrument(skip_all, fields(store = ?self.store_path))]
    pub fn run<F>(&self, mut progress: F) -> Result<UninstallReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let start = Instant::now();
        let mut store = BackupStore::open(self.store_path)?;
        let items = store.manifest().items.clone();
        let digests = store.manifest().digests.clone();
        info!(
            "Uninstalling {} ({} entries) from {:?}",
            store.manifest().name,
            items.len(),
            self.destination
        );

        let mut reader = store.reader();
        let total = items.len();
        let mut info = ProgressInfo {
            operation: "uninstall",
            current_item: None,
            processed: 0,
            total,
        };
        if !progress(&info) {
            return Err(ModvaultError::Aborted { path: None });
        }

        let mut report = UninstallReport::default();
        let mut failures = Vec::new();
        let mut unresolved: Vec<ItemEntry> = Vec::new();
        let mut aborted: Option<PathBuf> = None;

        let reversed: Vec<&ItemEntry> = items.iter().rev().collect();
        for (index, entry) in reversed.iter().enumerate() {
            match self.revert(entry, &mut reader, &digests, &mut report) {
                Ok(Reverted::Done) => {}
                Ok(Reverted::Kept) => {
                    if unresolved.iter().any(|e| e.path.starts_with(&entry.path)) {
                        unresolved.push((*entry).clone());
                    }
                }
                Err(e) => {
                    warn!("Could not revert {:?}: {}", entry.path, e);
                    failures.push(RestoreFailure::new(&entry.path, &e));
                    unresolved.push((*entry).clone());
                }
            }

            info.processed = index + 1;
            info.current_item = Some(entry.path.clone());
            if !progress(&info) {
                debug!("Uninstall aborted after {:?}", entry.path);
                unresolved.extend(reversed[index + 1..].iter().map(|e| (*e).clone()));
                aborted = Some(entry.path.clone());
                break;
            }
        }
        drop(reader);

        if failures.is_empty() && aborted.is_none() {
            let name = store.manifest().name.clone();
            store.delete()?;
            report.duration_ms = start.elapsed().as_millis() as u64;
            info!(
                "Uninstalled {}: {} restored, {} deleted, {} directories removed in {}ms",
                name,
                report.files_restored,
                report.files_deleted,
                report.directories_removed,
                report.duration_ms
            );
            return Ok(report);
        }

        let mut remaining: ItemSet = unresolved.into_iter().collect();
        remaining.sort_install_order();
        store.retain_items(remaining)?;

        match aborted {
            Some(path) => Err(ModvaultError::Aborted { path: Some(path) }),
            None => Err(ModvaultError::PartialRestore { failures }),
        }
    }

    fn revert(
        &self,
        entry: &ItemEntry,
        reader: &mut Result<BackupReader>,
        digests: &BTreeMap<String, String>,
        report: &mut UninstallReport,
    ) -> Result<Reverted> {
        let relative = entry.path.as_path();
        let dest = self.destination.join(relative);

        match (entry.kind, entry.disposition) {
            (ItemKind::File, ItemDisposition::CopyOverwrite) => {
                let reader = reader
                    .as_mut()
                    .map_err(|e| ModvaultError::corrupt(relative, e.to_string()))?;
                let digest = digests.get(&utils::zip_key(relative)).map(String::as_str);
                reader.restore(relative, &dest, digest)?;
                report.files_restored += 1;
                trace!("Restored {:?}", relative);
            }
            (ItemKind::File, _) => {
                if utils::remove_file_if_present(&dest)
                    .map_err(|e| ModvaultError::destination_write(relative, e))?
                {
                    report.files_deleted += 1;
                    trace!("Deleted {:?}", relative);
                }
            }
            (ItemKind::Directory, ItemDisposition::DeleteOnUninstall) => {
                if !dest.is_dir() {
                    return Ok(Reverted::Done);
                }
                if utils::remove_dir_if_empty(&dest)
                    .map_err(|e| ModvaultError::destination_write(relative, e))?
                {
                    report.directories_removed += 1;
                    trace!("Removed directory {:?}", relative);
                } else {
                    debug!("Keeping non-empty directory {:?}", relative);
                    report.directories_kept += 1;
                    return Ok(Reverted::Kept);
                }
            }
            (ItemKind::Directory, _) => {}
        }
        Ok(Reverted::Done)
    }
}

enum Reverted {
    Done,
    /// Directory left in place because it still holds files
    Kept,
}

/// Delete a backup store without restoring anything
///
/// Works on stores whose manifest no longer loads.
pub fn discard_store(store_path: &Path) -> Result<()> {
    if store_path.is_dir() {
        fs::remove_dir_all(store_path)?;
    } else {
        utils::remove_file_if_present(store_path)?;
    }
    info!("Discarded backup {:?} without restoring", store_path);
    Ok(())
}
