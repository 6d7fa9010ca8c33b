//! Install transaction
//!
//! Copies a package source onto the destination while preserving whatever it
//! overwrites. Every mutation is journaled before it happens; when a copy
//! fails, the callback aborts, or the backup cannot be committed, the journal
//! is replayed backwards and the destination ends up exactly as it was.
//!
//! ```text
//! Idle ──► Copying ──► Succeeded
//!             │
//!             └──► RollingBack ──► RolledBack
//! ```

use crate::backup::{BackupStore, BackupWriter};
use crate::error::{ModvaultError, Result, RestoreFailure};
use crate::footprint::compute_footprint;
use crate::identity::Identity;
use crate::overlap::find_overlaps;
use crate::package::SourceSide;
use crate::types::{
    Footprint, InstallReport, InstallTarget, ItemDisposition, ItemEntry, ItemKind, ItemSet,
    ProgressInfo,
};
use crate::utils;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use zip::ZipArchive;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Fail if any path the footprint touches goes through a symbolic link
fn refuse_links(footprint: &Footprint, destination: &Path) -> Result<()> {
    let mut checked = HashSet::new();
    for entry in footprint.iter() {
        let mut relative = PathBuf::new();
        for component in entry.path.components() {
            relative.push(component);
            if !checked.insert(relative.clone()) {
                continue;
            }
            match fs::symlink_metadata(destination.join(&relative)) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ModvaultError::destination_write(
                        &relative,
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "destination path is a symbolic link",
                        ),
                    ));
                }
                Ok(_) => {}
                // Nothing below a missing path can be a link
                Err(_) => break,
            }
        }
    }
    Ok(())
}

/// Phase of an install transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// Not started
    Idle,
    /// Items are being written
    Copying,
    /// Every item written and the backup committed
    Succeeded,
    /// Reverting journaled mutations
    RollingBack,
    /// Reverted after a failure or abort
    RolledBack,
}

/// How to undo one mutation
#[derive(Debug)]
enum UndoStep {
    /// Copy the staged original back over the destination
    Restore(PathBuf),
    /// Delete a file that did not exist before
    Delete(PathBuf),
    /// Remove a directory that did not exist before, if still empty
    RemoveDir(PathBuf),
}

impl UndoStep {
    fn path(&self) -> &Path {
        match self {
            UndoStep::Restore(path) | UndoStep::Delete(path) | UndoStep::RemoveDir(path) => path,
        }
    }
}

#[derive(Debug, Default)]
struct CopyStats {
    files_installed: usize,
    directories_created: usize,
    files_backed_up: usize,
    bytes_written: u64,
}

/// One install of one package source into one target
#[derive(Debug)]
pub struct InstallTransaction<'a> {
    identity: Identity,
    source: &'a SourceSide,
    target: &'a InstallTarget,
    state: InstallState,
    journal: Vec<UndoStep>,
}

impl<'a> InstallTransaction<'a> {
    /// Prepare an install of `source` into `target`
    pub fn new(identity: Identity, source: &'a SourceSide, target: &'a InstallTarget) -> Self {
        Self {
            identity,
            source,
            target,
            state: InstallState::Idle,
            journal: Vec::new(),
        }
    }

    /// Current phase
    pub fn state(&self) -> InstallState {
        self.state
    }

    /// Run the install
    ///
    /// `installed` lists the backups of every other installed package; the
    /// returned report names those the footprint overwrites. `progress` is
    /// called once before the first item and after every item; returning
    /// `false` aborts and rolls back.
    ///
    /// On success the committed store is returned alongside the report.
    #[instrument(skip_all, fields(package = %self.source.name))]
    pub fn run<F>(
        &mut self,
        installed: &[(Identity, ItemSet)],
        mut progress: F,
    ) -> Result<(InstallReport, BackupStore)>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let start = Instant::now();
        info!(
            "Installing {} into {:?}",
            self.source.name, self.target.destination
        );

        let footprint = compute_footprint(&self.source.items, &self.target.destination);
        refuse_links(&footprint, &self.target.destination)?;
        let overlaps = find_overlaps(&footprint, installed, self.target.case);
        if !overlaps.is_empty() {
            warn!(
                "{} overwrites files backed up by {} installed package(s)",
                self.source.name,
                overlaps.len()
            );
        }

        let mut writer = BackupWriter::create(
            &self.target.backup_root,
            &self.source.name,
            self.target.mode,
        )?;
        let mut archive = self.open_archive()?;

        self.state = InstallState::Copying;
        let mut stats = CopyStats::default();
        let outcome = self
            .copy_all(&footprint, &mut writer, archive.as_mut(), &mut stats, &mut progress)
            .and_then(|()| writer.commit(self.identity, &footprint, &overlaps));

        match outcome {
            Ok(store) => {
                self.state = InstallState::Succeeded;
                let report = InstallReport {
                    identity: self.identity,
                    files_installed: stats.files_installed,
                    directories_created: stats.directories_created,
                    files_backed_up: stats.files_backed_up,
                    bytes_written: stats.bytes_written,
                    backup_path: store.path().to_path_buf(),
                    overlaps,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                info!(
                    "Installed {}: {} files, {} backed up, {} in {}ms",
                    self.source.name,
                    report.files_installed,
                    report.files_backed_up,
                    utils::format_bytes(report.bytes_written),
                    report.duration_ms
                );
                Ok((report, store))
            }
            Err(cause) => {
                warn!("Install of {} failed: {}. Rolling back", self.source.name, cause);
                self.state = InstallState::RollingBack;
                let failures = self.rollback(&writer);
                writer.discard();
                self.state = InstallState::RolledBack;

                if failures.is_empty() {
                    info!("Rolled back {}", self.source.name);
                    Err(cause)
                } else {
                    Err(ModvaultError::RollbackIncomplete {
                        cause: Box::new(cause),
                        failures,
                    })
                }
            }
        }
    }

    fn open_archive(&self) -> Result<Option<ZipArchive<File>>> {
        if !self.source.is_archive {
            return Ok(None);
        }
        let archive_name = PathBuf::from(self.source.root.file_name().unwrap_or_default());
        let file = File::open(&self.source.root)
            .map_err(|e| ModvaultError::source_unavailable(&archive_name, e))?;
        let archive = ZipArchive::new(file)
            .map_err(|e| ModvaultError::source_unavailable(&archive_name, io::Error::other(e)))?;
        Ok(Some(archive))
    }

    fn copy_all<F>(
        &mut self,
        footprint: &Footprint,
        writer: &mut BackupWriter,
        mut archive: Option<&mut ZipArchive<File>>,
        stats: &mut CopyStats,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let total = footprint.len();
        let mut info = ProgressInfo {
            operation: "install",
            current_item: None,
            processed: 0,
            total,
        };
        if !progress(&info) {
            return Err(ModvaultError::Aborted { path: None });
        }

        if fs::symlink_metadata(&self.target.destination).is_err() {
            self.journal.push(UndoStep::RemoveDir(PathBuf::new()));
            fs::create_dir_all(&self.target.destination)
                .map_err(|e| ModvaultError::destination_write(Path::new(""), e))?;
        }

        for (index, entry) in footprint.iter().enumerate() {
            self.install_entry(entry, writer, archive.as_deref_mut(), stats)?;

            info.processed = index + 1;
            info.current_item = Some(entry.path.clone());
            if !progress(&info) {
                debug!("Install aborted after {:?}", entry.path);
                return Err(ModvaultError::Aborted {
                    path: Some(entry.path.clone()),
                });
            }
        }
        Ok(())
    }

    fn install_entry(
        &mut self,
        entry: &ItemEntry,
        writer: &mut BackupWriter,
        archive: Option<&mut ZipArchive<File>>,
        stats: &mut CopyStats,
    ) -> Result<()> {
        let relative = entry.path.as_path();
        let dest = self.target.destination.join(relative);

        match entry.kind {
            ItemKind::Directory => {
                if entry.disposition == ItemDisposition::DeleteOnUninstall {
                    self.journal.push(UndoStep::RemoveDir(relative.to_path_buf()));
                    stats.directories_created += 1;
                }
                fs::create_dir_all(&dest)
                    .map_err(|e| ModvaultError::destination_write(relative, e))?;
                trace!("Directory {:?}", relative);
            }
            ItemKind::File => {
                let mut reader = self.open_source(entry, archive)?;

                if entry.disposition == ItemDisposition::CopyOverwrite {
                    writer
                        .preserve(relative, &dest)
                        .map_err(|e| ModvaultError::destination_write(relative, e))?;
                    self.journal.push(UndoStep::Restore(relative.to_path_buf()));
                    stats.files_backed_up += 1;
                } else {
                    self.journal.push(UndoStep::Delete(relative.to_path_buf()));
                }

                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| ModvaultError::destination_write(relative, e))?;
                }
                let mut out = File::create(&dest)
                    .map_err(|e| ModvaultError::destination_write(relative, e))?;
                let bytes = copy_stream(&mut reader, &mut out, relative)?;

                stats.files_installed += 1;
                stats.bytes_written += bytes;
                trace!("File {:?} ({} bytes)", relative, bytes);
            }
        }
        Ok(())
    }

    fn open_source<'z>(
        &self,
        entry: &ItemEntry,
        archive: Option<&'z mut ZipArchive<File>>,
    ) -> Result<Box<dyn Read + 'z>> {
        let relative = entry.path.as_path();
        match (archive, entry.zip_index) {
            (Some(archive), Some(index)) => {
                let file = archive.by_index(index).map_err(|e| {
                    ModvaultError::source_unavailable(relative, io::Error::other(e))
                })?;
                Ok(Box::new(file))
            }
            (Some(_), None) => Err(ModvaultError::source_unavailable(
                relative,
                io::Error::new(io::ErrorKind::NotFound, "no archive entry for this file"),
            )),
            (None, _) => {
                let file = File::open(self.source.root.join(relative))
                    .map_err(|e| ModvaultError::source_unavailable(relative, e))?;
                Ok(Box::new(file))
            }
        }
    }

    /// Replay the journal backwards, collecting every step that fails
    fn rollback(&mut self, writer: &BackupWriter) -> Vec<RestoreFailure> {
        let destination = &self.target.destination;
        let mut failures = Vec::new();

        while let Some(step) = self.journal.pop() {
            let dest = destination.join(step.path());
            let outcome = match &step {
                UndoStep::Restore(relative) => writer.unstage(relative, &dest),
                UndoStep::Delete(_) => utils::remove_file_if_present(&dest).map(|_| ()),
                UndoStep::RemoveDir(_) => utils::remove_dir_if_empty(&dest).map(|_| ()),
            };
            match outcome {
                Ok(()) => trace!("Reverted {:?}", step.path()),
                Err(e) => {
                    warn!("Could not revert {:?}: {}", step.path(), e);
                    failures.push(RestoreFailure::new(step.path(), e));
                }
            }
        }
        failures
    }
}

/// Copy `reader` into `writer`, telling read failures from write failures
fn copy_stream(reader: &mut dyn Read, writer: &mut File, relative: &Path) -> Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ModvaultError::source_unavailable(relative, e)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|e| ModvaultError::destination_write(relative, e))?;
        total += read as u64;
    }
    writer
        .flush()
        .map_err(|e| ModvaultError::destination_write(relative, e))?;
    Ok(total)
}
