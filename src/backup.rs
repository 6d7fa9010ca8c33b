//! Backup stores
//!
//! A backup store holds every destination file an install overwrote, plus a
//! manifest describing the whole install so it can be reversed later, even
//! after a restart. Stores live in a Location's backup root in one of two
//! layouts chosen by its `zip_level`:
//!
//! ```text
//! backup_root/
//! ├── <name>.zip             # zip mode (zip_level 0..=9)
//! │   ├── backup.json        # BackupManifest
//! │   └── files/<relative>   # preserved destination files
//! └── <name>/                # folder mode (zip_level -1)
//!     ├── backup.json
//!     └── files/<relative>
//! ```
//!
//! During an install, preserved files go to a hidden staging directory
//! (`.staging-*`) inside the backup root. Rollback restores from there;
//! commit turns it into the final store in one rename (folder) or by packing
//! it into a temporary zip that is then persisted (zip). A failed or aborted
//! install simply drops the staging directory.

use crate::error::{ModvaultError, Result};
use crate::identity::{self, Identity};
use crate::types::{BackupMode, ItemSet};
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Name of the manifest inside every store
pub const MANIFEST_NAME: &str = "backup.json";

/// Current manifest format
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const FILES_DIR: &str = "files";
const STAGING_PREFIX: &str = ".staging-";

/// Everything needed to reverse an install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Version of the manifest format
    pub format_version: u32,
    /// Identity of the installed package
    pub identity: Identity,
    /// Name of the installed package
    pub name: String,
    /// When the install completed
    pub created_at: DateTime<Utc>,
    /// Footprint of the install, in install order
    pub items: ItemSet,
    /// Installed packages whose backed-up files this install overwrote
    #[serde(default)]
    pub overlaps: BTreeSet<Identity>,
    /// SHA-256 of each preserved file, keyed by forward-slash relative path
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
    /// Engine version that wrote the store
    pub engine_version: String,
}

/// On-disk layout of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `<name>.zip`
    Zip,
    /// `<name>/`
    Folder,
}

/// Where the store for `name` lives under `root` in the given mode
pub fn store_path(root: &Path, name: &str, mode: BackupMode) -> PathBuf {
    match mode {
        BackupMode::Folder => root.join(name),
        BackupMode::Zip { .. } => root.join(format!("{}.zip", name)),
    }
}

/// Whether a directory entry under a backup root is an in-progress staging area
pub fn is_staging_entry(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(STAGING_PREFIX))
        .unwrap_or(false)
}

/// Whether `path` looks like a store (without reading it)
pub fn looks_like_store(path: &Path) -> bool {
    if is_staging_entry(path) {
        return false;
    }
    if path.is_dir() {
        path.join(MANIFEST_NAME).is_file()
    } else {
        path.is_file()
            && path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false)
    }
}

/// Entry options for `level`; the manifest is always written with level 0
fn zip_options(level: u8, size: u64) -> SimpleFileOptions {
    let options = SimpleFileOptions::default().large_file(size >= u32::MAX as u64);
    if level == 0 {
        options.compression_method(CompressionMethod::Stored)
    } else {
        options
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level.into()))
    }
}

fn entry_name(relative: &Path) -> String {
    format!("{}/{}", FILES_DIR, utils::zip_key(relative))
}

/// Staging area for the store an install is building
pub struct BackupWriter {
    root: PathBuf,
    name: String,
    mode: BackupMode,
    final_path: PathBuf,
    staging: TempDir,
    digests: BTreeMap<String, String>,
}

impl std::fmt::Debug for BackupWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupWriter")
            .field("final_path", &self.final_path)
            .field("staging", &self.staging.path())
            .field("preserved", &self.digests.len())
            .finish()
    }
}

impl BackupWriter {
    /// Start a new store for `name` under `root`
    ///
    /// Fails with [`ModvaultError::BackupExists`] if a store for that name is
    /// already present in either layout.
    pub fn create(root: &Path, name: &str, mode: BackupMode) -> Result<Self> {
        fs::create_dir_all(root)?;
        for existing in [
            store_path(root, name, BackupMode::Folder),
            store_path(root, name, BackupMode::Zip { level: 0 }),
        ] {
            if looks_like_store(&existing) {
                return Err(ModvaultError::BackupExists(existing));
            }
        }

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(root)?;
        fs::create_dir(staging.path().join(FILES_DIR))?;
        trace!("Staging backup for {} in {:?}", name, staging.path());

        Ok(Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            mode,
            final_path: store_path(root, name, mode),
            staging,
            digests: BTreeMap::new(),
        })
    }

    /// Where the committed store will live
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Staged copy of a preserved file
    pub fn staged_path(&self, relative: &Path) -> PathBuf {
        self.staging.path().join(FILES_DIR).join(relative)
    }

    /// Copy the existing destination file into the staging area verbatim
    pub fn preserve(&mut self, relative: &Path, existing: &Path) -> io::Result<u64> {
        let staged = self.staged_path(relative);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = fs::copy(existing, &staged)?;
        self.digests
            .insert(utils::zip_key(relative), utils::digest_file(&staged)?);
        trace!("Preserved {:?} ({} bytes)", relative, bytes);
        Ok(bytes)
    }

    /// Copy a preserved file back over the destination
    pub fn unstage(&self, relative: &Path, destination: &Path) -> io::Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(self.staged_path(relative), destination)?;
        Ok(())
    }

    /// Persist the store with its manifest
    ///
    /// On error the staging area is left intact so the caller can still roll
    /// back from it.
    pub fn commit(
        &mut self,
        identity: Identity,
        items: &ItemSet,
        overlaps: &BTreeSet<Identity>,
    ) -> Result<BackupStore> {
        let manifest = BackupManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            identity,
            name: self.name.clone(),
            created_at: Utc::now(),
            items: items.clone(),
            overlaps: overlaps.clone(),
            digests: self.digests.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;

        let kind = match self.mode {
            BackupMode::Folder => {
                fs::write(self.staging.path().join(MANIFEST_NAME), &manifest_json)?;
                fs::rename(self.staging.path(), &self.final_path)?;
                StoreKind::Folder
            }
            BackupMode::Zip { level } => {
                self.pack_zip(level, &manifest_json)?;
                StoreKind::Zip
            }
        };

        info!(
            "Committed backup {:?} ({} preserved files, {} entries)",
            self.final_path,
            self.digests.len(),
            items.len()
        );
        Ok(BackupStore {
            path: self.final_path.clone(),
            kind,
            manifest,
        })
    }

    fn pack_zip(&self, level: u8, manifest_json: &[u8]) -> Result<()> {
        let mut temp = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".zip")
            .tempfile_in(&self.root)?;
        {
            let mut zip = ZipWriter::new(temp.as_file_mut());
            zip.start_file(MANIFEST_NAME, zip_options(0, manifest_json.len() as u64))?;
            zip.write_all(manifest_json)?;

            let files_root = self.staging.path().join(FILES_DIR);
            for entry in WalkDir::new(&files_root).min_depth(1).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = utils::make_relative(entry.path(), &files_root)?;
                let size = entry.metadata()?.len();
                zip.start_file(entry_name(&relative), zip_options(level, size))?;
                io::copy(&mut File::open(entry.path())?, &mut zip)?;
            }
            zip.finish()?;
        }
        temp.persist(&self.final_path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Drop the staging area without writing a store
    pub fn discard(self) {
        debug!("Discarding staged backup for {}", self.name);
    }
}

/// A persisted backup store
#[derive(Debug, Clone)]
pub struct BackupStore {
    path: PathBuf,
    kind: StoreKind,
    manifest: BackupManifest,
}

impl BackupStore {
    /// Open the store at `path` and load its manifest
    ///
    /// Any problem reading it is reported as [`ModvaultError::BackupCorrupt`].
    pub fn open(path: &Path) -> Result<Self> {
        let (kind, raw) = if path.is_dir() {
            let raw = fs::read(path.join(MANIFEST_NAME))
                .map_err(|e| ModvaultError::corrupt(path, format!("cannot read manifest: {}", e)))?;
            (StoreKind::Folder, raw)
        } else {
            let file = File::open(path)
                .map_err(|e| ModvaultError::corrupt(path, format!("cannot open: {}", e)))?;
            let mut archive = ZipArchive::new(file).map_err(|e| ModvaultError::corrupt(path, e))?;
            let mut manifest_file = archive
                .by_name(MANIFEST_NAME)
                .map_err(|e| ModvaultError::corrupt(path, format!("no manifest: {}", e)))?;
            let mut raw = Vec::new();
            manifest_file
                .read_to_end(&mut raw)
                .map_err(|e| ModvaultError::corrupt(path, e))?;
            (StoreKind::Zip, raw)
        };

        let manifest: BackupManifest =
            serde_json::from_slice(&raw).map_err(|e| ModvaultError::corrupt(path, e))?;
        if manifest.format_version > MANIFEST_FORMAT_VERSION {
            return Err(ModvaultError::corrupt(
                path,
                format!("unsupported manifest format {}", manifest.format_version),
            ));
        }
        manifest
            .items
            .validate()
            .map_err(|e| ModvaultError::corrupt(path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            kind,
            manifest,
        })
    }

    /// Existing store for `name` under `root`, in either layout
    pub fn locate(root: &Path, name: &str) -> Option<PathBuf> {
        [
            store_path(root, name, BackupMode::Zip { level: 0 }),
            store_path(root, name, BackupMode::Folder),
        ]
        .into_iter()
        .find(|candidate| looks_like_store(candidate))
    }

    /// Store location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store layout
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Loaded manifest
    pub fn manifest(&self) -> &BackupManifest {
        &self.manifest
    }

    /// Identity the store links to, taken from its file name
    pub fn identity(&self) -> Result<Identity> {
        Identity::from_path(&self.path)
    }

    /// Package name the store links to, taken from its file name
    pub fn name(&self) -> Result<String> {
        identity::package_name(&self.path)
    }

    /// Open the store for restoring entries
    pub fn reader(&self) -> Result<BackupReader> {
        match self.kind {
            StoreKind::Folder => Ok(BackupReader::Folder(self.path.join(FILES_DIR))),
            StoreKind::Zip => {
                let file = File::open(&self.path)
                    .map_err(|e| ModvaultError::corrupt(&self.path, format!("cannot open: {}", e)))?;
                let archive =
                    ZipArchive::new(file).map_err(|e| ModvaultError::corrupt(&self.path, e))?;
                Ok(BackupReader::Zip(archive))
            }
        }
    }

    /// Rewrite the manifest so it only lists `items`
    ///
    /// Used after a partial uninstall: restored entries drop out, unresolved
    /// ones stay so the uninstall can be retried.
    pub fn retain_items(&mut self, items: ItemSet) -> Result<()> {
        let keys: BTreeSet<String> = items.files().map(|e| utils::zip_key(&e.path)).collect();
        let mut manifest = self.manifest.clone();
        manifest.items = items;
        manifest.digests.retain(|key, _| keys.contains(key));
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;

        match self.kind {
            StoreKind::Folder => {
                utils::atomic_write(&self.path.join(MANIFEST_NAME), &manifest_json)?;
            }
            StoreKind::Zip => {
                let root = self
                    .path
                    .parent()
                    .ok_or_else(|| ModvaultError::internal("backup store has no parent directory"))?;
                let mut archive = ZipArchive::new(File::open(&self.path)?)?;
                let mut temp = tempfile::Builder::new()
                    .prefix(STAGING_PREFIX)
                    .suffix(".zip")
                    .tempfile_in(root)?;
                {
                    let mut zip = ZipWriter::new(temp.as_file_mut());
                    for index in 0..archive.len() {
                        let file = archive.by_index_raw(index)?;
                        let keep = file
                            .name()
                            .strip_prefix(FILES_DIR)
                            .and_then(|rest| rest.strip_prefix('/'))
                            .map(|key| keys.contains(key))
                            .unwrap_or(false);
                        if keep {
                            zip.raw_copy_file(file)?;
                        }
                    }
                    zip.start_file(MANIFEST_NAME, zip_options(0, manifest_json.len() as u64))?;
                    zip.write_all(&manifest_json)?;
                    zip.finish()?;
                }
                drop(archive);
                temp.persist(&self.path).map_err(|e| e.error)?;
            }
        }

        debug!(
            "Backup {:?} now tracks {} entries",
            self.path,
            manifest.items.len()
        );
        self.manifest = manifest;
        Ok(())
    }

    /// Replace the recorded overlap set
    pub fn set_overlaps(&mut self, overlaps: BTreeSet<Identity>) -> Result<()> {
        self.manifest.overlaps = overlaps;
        let items = self.manifest.items.clone();
        self.retain_items(items)
    }

    /// Move the store into `new_root`, keeping its file name
    pub fn relocate(&mut self, new_root: &Path) -> Result<()> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| ModvaultError::internal("backup store has no file name"))?;
        let target = new_root.join(file_name);
        if target.exists() {
            return Err(ModvaultError::BackupExists(target));
        }
        utils::move_path(&self.path, &target)?;
        info!("Moved backup {:?} to {:?}", self.path, target);
        self.path = target;
        Ok(())
    }

    /// Delete the store from disk
    pub fn delete(self) -> Result<()> {
        match self.kind {
            StoreKind::Folder => fs::remove_dir_all(&self.path)?,
            StoreKind::Zip => fs::remove_file(&self.path)?,
        }
        info!("Deleted backup {:?}", self.path);
        Ok(())
    }
}

/// Open handle for copying preserved files back out of a store
pub enum BackupReader {
    /// Zip store, archive kept open across entries
    Zip(ZipArchive<File>),
    /// Folder store, path of its `files/` directory
    Folder(PathBuf),
}

impl BackupReader {
    /// Restore the preserved copy of `relative` onto `destination`
    ///
    /// The content is written to a temporary file beside `destination`,
    /// checked against `expected_digest` when one is recorded, and only then
    /// moved over the destination, so a corrupt entry never clobbers the
    /// current file.
    pub fn restore(
        &mut self,
        relative: &Path,
        destination: &Path,
        expected_digest: Option<&str>,
    ) -> Result<u64> {
        let parent = destination
            .parent()
            .ok_or_else(|| ModvaultError::internal(format!("{:?} has no parent", destination)))?;
        fs::create_dir_all(parent).map_err(|e| ModvaultError::destination_write(relative, e))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".restore-")
            .tempfile_in(parent)
            .map_err(|e| ModvaultError::destination_write(relative, e))?;

        let bytes = match self {
            BackupReader::Folder(files_root) => {
                let mut source = File::open(files_root.join(relative)).map_err(|e| {
                    ModvaultError::corrupt(relative, format!("preserved copy unreadable: {}", e))
                })?;
                io::copy(&mut source, temp.as_file_mut())
                    .map_err(|e| ModvaultError::destination_write(relative, e))?
            }
            BackupReader::Zip(archive) => {
                let mut source = archive.by_name(&entry_name(relative)).map_err(|e| {
                    ModvaultError::corrupt(relative, format!("preserved copy unreadable: {}", e))
                })?;
                io::copy(&mut source, temp.as_file_mut())
                    .map_err(|e| ModvaultError::destination_write(relative, e))?
            }
        };
        temp.as_file_mut()
            .flush()
            .map_err(|e| ModvaultError::destination_write(relative, e))?;

        if let Some(expected) = expected_digest {
            let actual = utils::digest_file(temp.path())
                .map_err(|e| ModvaultError::destination_write(relative, e))?;
            if actual != expected {
                warn!("Digest mismatch restoring {:?}", relative);
                return Err(ModvaultError::corrupt(relative, "preserved copy fails its digest check"));
            }
        }

        temp.persist(destination)
            .map_err(|e| ModvaultError::destination_write(relative, e.error))?;
        Ok(bytes)
    }
}
