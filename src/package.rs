//! Package model
//!
//! A package is known by up to two sides that share one [`Identity`]:
//!
//! - the **source** side, a folder or archive in the library that can be
//!   installed, and
//! - the **backup** side, the store an install left behind, which is what
//!   makes the package "installed".
//!
//! Either side may be missing (a library item never installed, or an
//! installed package whose source was since removed), but a package with
//! neither side is not valid and is dropped by its Location.

use crate::backup::BackupStore;
use crate::error::{ModvaultError, Result};
use crate::footprint::{compute_footprint, scan_archive, scan_folder};
use crate::identity::{self, Identity};
use crate::install::InstallTransaction;
use crate::overlap::{detect_overlap, InstalledBackups};
use crate::types::{Footprint, InstallReport, InstallTarget, ItemSet, PathCase, ProgressInfo, UninstallReport};
use crate::uninstall::{discard_store, UninstallTransaction};
use crate::version;
use semver::Version;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Which sides a package currently has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageSide {
    /// Available in the library, not installed
    SourceOnly,
    /// Installed, source no longer in the library
    BackupOnly,
    /// Installed and available
    Both,
}

/// Installable content of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSide {
    /// Package name
    pub name: String,
    /// Folder or archive path
    pub root: PathBuf,
    /// Whether `root` is a zip archive
    pub is_archive: bool,
    /// Scanned entries in install order
    pub items: ItemSet,
}

impl SourceSide {
    /// Scan a library folder or archive
    pub fn scan(path: &Path) -> Result<Self> {
        let name = identity::package_name(path)?;
        let is_archive = path.is_file() && identity::is_archive_path(path);
        let items = if is_archive {
            scan_archive(path)?
        } else if path.is_dir() {
            scan_folder(path)?
        } else {
            return Err(ModvaultError::InvalidPackage(format!(
                "{:?} is neither a folder nor a package archive",
                path
            )));
        };
        Ok(Self {
            name,
            root: path.to_path_buf(),
            is_archive,
            items,
        })
    }

    /// Identity derived from the source name
    pub fn identity(&self) -> Identity {
        Identity::from_name(&self.name)
    }
}

/// What an install left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSide {
    /// Store path
    pub path: PathBuf,
    /// Footprint recorded at install time
    pub items: ItemSet,
    /// Installed packages whose backed-up files the install overwrote
    pub overlaps: BTreeSet<Identity>,
}

impl BackupSide {
    /// Side describing an opened store
    pub fn from_store(store: &BackupStore) -> Self {
        Self {
            path: store.path().to_path_buf(),
            items: store.manifest().items.clone(),
            overlaps: store.manifest().overlaps.clone(),
        }
    }

    /// Open the store at `path` and describe it
    pub fn load(path: &Path) -> Result<Self> {
        BackupStore::open(path).map(|store| Self::from_store(&store))
    }

    /// Identity derived from the store's file name
    pub fn identity(&self) -> Result<Identity> {
        Identity::from_path(&self.path)
    }
}

/// A package with its source and/or backup side
#[derive(Debug, Clone)]
pub struct Package {
    identity: Identity,
    name: String,
    source: Option<SourceSide>,
    backup: Option<BackupSide>,
    dependencies: BTreeSet<String>,
}

impl Package {
    /// Package from a library folder or archive
    pub fn from_source(path: &Path) -> Result<Self> {
        let source = SourceSide::scan(path)?;
        Ok(Self {
            identity: source.identity(),
            name: source.name.clone(),
            source: Some(source),
            backup: None,
            dependencies: BTreeSet::new(),
        })
    }

    /// Package from a backup store alone
    pub fn from_backup(path: &Path) -> Result<Self> {
        let store = BackupStore::open(path)?;
        Ok(Self {
            identity: store.identity()?,
            name: store.name()?,
            source: None,
            backup: Some(BackupSide::from_store(&store)),
            dependencies: BTreeSet::new(),
        })
    }

    /// Package from whichever sides are present
    pub fn from_sides(source: Option<SourceSide>, backup: Option<BackupSide>) -> Result<Self> {
        let (identity, name) = match (&source, &backup) {
            (Some(source), _) => (source.identity(), source.name.clone()),
            (None, Some(backup)) => (backup.identity()?, identity::package_name(&backup.path)?),
            (None, None) => {
                return Err(ModvaultError::InvalidPackage(
                    "a package needs a source or a backup".to_string(),
                ))
            }
        };
        let mut package = Self {
            identity,
            name,
            source: None,
            backup: None,
            dependencies: BTreeSet::new(),
        };
        package.set_sides(source, backup)?;
        Ok(package)
    }

    /// Replace both sides, checking they belong to this package
    pub(crate) fn set_sides(
        &mut self,
        source: Option<SourceSide>,
        backup: Option<BackupSide>,
    ) -> Result<()> {
        if let Some(source) = &source {
            self.check_identity(source.identity())?;
        }
        if let Some(backup) = &backup {
            self.check_identity(backup.identity()?)?;
        }
        self.source = source;
        self.backup = backup;
        Ok(())
    }

    /// Link a source side
    pub fn attach_source(&mut self, source: SourceSide) -> Result<()> {
        self.check_identity(source.identity())?;
        self.source = Some(source);
        Ok(())
    }

    /// Link a backup side
    pub fn attach_backup(&mut self, backup: BackupSide) -> Result<()> {
        self.check_identity(backup.identity()?)?;
        self.backup = Some(backup);
        Ok(())
    }

    fn check_identity(&self, actual: Identity) -> Result<()> {
        if actual != self.identity {
            return Err(ModvaultError::IdentityMismatch {
                expected: self.identity,
                actual,
            });
        }
        Ok(())
    }

    /// Stable identity
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Full package name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without its trailing version token
    pub fn core_name(&self) -> String {
        version::split_name(&self.name).0
    }

    /// Version parsed from the name, if it carries one
    pub fn version(&self) -> Option<Version> {
        version::split_name(&self.name).1
    }

    /// Dependency identifiers, matched against core names
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Replace the dependency identifiers
    pub fn set_dependencies<I, S>(&mut self, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies
            .into_iter()
            .map(Into::into)
            .map(|d: String| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
    }

    /// Sides currently present, `None` when the package is invalid
    pub fn side(&self) -> Option<PackageSide> {
        match (&self.source, &self.backup) {
            (Some(_), Some(_)) => Some(PackageSide::Both),
            (Some(_), None) => Some(PackageSide::SourceOnly),
            (None, Some(_)) => Some(PackageSide::BackupOnly),
            (None, None) => None,
        }
    }

    /// Whether at least one side is present
    pub fn is_valid(&self) -> bool {
        self.side().is_some()
    }

    /// Whether the package has a backup side
    pub fn is_installed(&self) -> bool {
        self.backup.is_some()
    }

    /// Source side
    pub fn source(&self) -> Option<&SourceSide> {
        self.source.as_ref()
    }

    /// Backup side
    pub fn backup(&self) -> Option<&BackupSide> {
        self.backup.as_ref()
    }

    pub(crate) fn set_backup(&mut self, backup: Option<BackupSide>) {
        self.backup = backup;
    }

    /// Installed packages this install overwrote, if installed
    pub fn overlaps(&self) -> Option<&BTreeSet<Identity>> {
        self.backup.as_ref().map(|b| &b.overlaps)
    }

    /// Footprint of the source against the live destination
    pub fn footprint(&self, destination: &Path) -> Result<Footprint> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| ModvaultError::MissingSource(self.name.clone()))?;
        Ok(compute_footprint(&source.items, destination))
    }

    /// Whether installing this package would overwrite a file `other` backed up
    ///
    /// Directional: `a.overlaps_with(b)` and `b.overlaps_with(a)` may differ.
    /// False when `other` is not installed.
    pub fn overlaps_with(&self, other: &Package, destination: &Path, case: PathCase) -> Result<bool> {
        match &other.backup {
            Some(backup) => Ok(detect_overlap(&self.footprint(destination)?, &backup.items, case)),
            None => Ok(false),
        }
    }

    /// Install into `target`
    ///
    /// On success the backup side is set from the committed store.
    pub fn install<F>(
        &mut self,
        target: &InstallTarget,
        installed: &dyn InstalledBackups,
        progress: F,
    ) -> Result<InstallReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        if self.backup.is_some() {
            return Err(ModvaultError::AlreadyInstalled(self.name.clone()));
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| ModvaultError::MissingSource(self.name.clone()))?;

        let others = installed.installed_backups(self.identity);
        let (report, store) = InstallTransaction::new(self.identity, source, target).run(&others, progress)?;
        self.backup = Some(BackupSide::from_store(&store));
        Ok(report)
    }

    /// Uninstall from `destination`
    ///
    /// On success the backup side is cleared. On a partial restore or abort it
    /// is reloaded so it lists only what is still outstanding.
    pub fn uninstall<F>(&mut self, destination: &Path, progress: F) -> Result<UninstallReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let store_path = self
            .backup
            .as_ref()
            .map(|b| b.path.clone())
            .ok_or_else(|| ModvaultError::NotInstalled(self.name.clone()))?;

        let result = UninstallTransaction::new(&store_path, destination).run(progress);
        match &result {
            Ok(_) => self.backup = None,
            Err(e) => match BackupSide::load(&store_path) {
                Ok(side) => self.backup = Some(side),
                Err(_) if !store_path.exists() => self.backup = None,
                Err(reload) => warn!("Keeping stale backup side for {}: {} ({})", self.name, reload, e),
            },
        }
        result
    }

    /// Delete the backup without restoring anything
    pub fn discard_backup(&mut self) -> Result<()> {
        let backup = self
            .backup
            .as_ref()
            .ok_or_else(|| ModvaultError::NotInstalled(self.name.clone()))?;
        discard_store(&backup.path)?;
        self.backup = None;
        Ok(())
    }

    /// Move the backup store into `new_root`
    pub fn relocate_backup(&mut self, new_root: &Path) -> Result<()> {
        let backup = self
            .backup
            .as_mut()
            .ok_or_else(|| ModvaultError::NotInstalled(self.name.clone()))?;
        let mut store = BackupStore::open(&backup.path)?;
        store.relocate(new_root)?;
        backup.path = store.path().to_path_buf();
        Ok(())
    }

    /// Whether this package is a newer version of `other`
    pub fn is_upgrade_of(&self, other: &Package) -> bool {
        if self.identity == other.identity || !version::same_core_name(&self.core_name(), &other.core_name()) {
            return false;
        }
        match (self.version(), other.version()) {
            (Some(mine), Some(theirs)) => mine > theirs,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Re-check the source side against the filesystem
    ///
    /// Clears the side and returns `false` if it vanished, changed kind, or
    /// its path no longer maps to this identity.
    pub fn revalidate_source(&mut self) -> bool {
        let Some(source) = &self.source else {
            return false;
        };
        let still_there = if source.is_archive {
            source.root.is_file()
        } else {
            source.root.is_dir()
        };
        let same_identity = Identity::from_path(&source.root)
            .map(|id| id == self.identity)
            .unwrap_or(false);

        if still_there && same_identity {
            true
        } else {
            info!("Source of {} is gone: {:?}", self.name, source.root);
            self.source = None;
            false
        }
    }

    /// Re-check the backup side against the filesystem
    ///
    /// Clears the side and returns `false` if the store vanished, no longer
    /// loads, or belongs to another identity.
    pub fn revalidate_backup(&mut self) -> bool {
        let Some(backup) = &self.backup else {
            return false;
        };
        let reloaded = BackupSide::load(&backup.path).and_then(|side| {
            self.check_identity(side.identity()?)?;
            Ok(side)
        });
        match reloaded {
            Ok(side) => {
                self.backup = Some(side);
                true
            }
            Err(e) => {
                debug!("Backup of {} no longer valid: {}", self.name, e);
                self.backup = None;
                false
            }
        }
    }
}
