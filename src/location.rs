//! Package registry for one destination
//!
//! A [`Location`] ties a library of package sources, a destination tree and
//! a backup root together. It discovers packages on both sides, links them by
//! identity, runs install and uninstall transactions against them and answers
//! cross-package questions (overlaps, dependencies, upgrades).
//!
//! ## Concurrency
//!
//! Packages sit behind `parking_lot` mutexes and are only ever locked briefly:
//! a transaction clones the package, runs against the clone without holding
//! any lock, then writes the resulting backup side back. At most one
//! transaction runs per package; a second one fails fast with
//! [`ModvaultError::PackageBusy`].
//!
//! Long transactions can be pushed onto tokio's blocking pool with
//! [`Location::spawn_install`] and [`Location::spawn_uninstall`], which return
//! a [`TransactionHandle`] that can cancel and await the work.

use crate::error::{ModvaultError, Result, RestoreFailure};
use crate::identity::{self, Identity};
use crate::overlap::{find_overlaps, InstalledBackups};
use crate::package::{BackupSide, Package, SourceSide};
use crate::types::{
    CancelToken, InstallReport, InstallTarget, ItemSet, LocationConfig, PathCase, ProgressCallback,
    ProgressInfo, RelocateReport, UninstallReport,
};
use crate::{backup, version};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Shared handle to a registered package
pub type PackageHandle = Arc<Mutex<Package>>;

/// Zip level used when the builder is not given one
pub const DEFAULT_ZIP_LEVEL: i32 = 6;

/// Builder for creating a [`Location`] with custom settings
///
/// # Examples
///
/// ```rust,no_run
/// use modvault::{LocationBuilder, PathCase};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let location = LocationBuilder::new()
///     .name("Skyrim")
///     .zip_level(-1) // keep backups as plain folders
///     .case(PathCase::Insensitive)
///     .build("./library", "./game", "./backups")?;
/// println!("{} packages", location.packages().len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocationBuilder {
    name: Option<String>,
    zip_level: i32,
    case: PathCase,
}

impl LocationBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            name: None,
            zip_level: DEFAULT_ZIP_LEVEL,
            case: PathCase::native(),
        }
    }

    /// Set the display name
    ///
    /// Defaults to the destination directory's name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the backup mode
    ///
    /// `-1` keeps backups as folders, `0` stores them in uncompressed zips
    /// and `1..=9` selects the deflate strength.
    pub fn zip_level(mut self, level: i32) -> Self {
        self.zip_level = level;
        self
    }

    /// Set the path comparison rule for overlap detection
    pub fn case(mut self, case: PathCase) -> Self {
        self.case = case;
        self
    }

    /// Configuration these settings describe
    pub fn config(
        &self,
        library: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        backup: impl Into<PathBuf>,
    ) -> LocationConfig {
        let destination = destination.into();
        let name = self.name.clone().unwrap_or_else(|| {
            destination
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string())
        });
        LocationConfig {
            name,
            library_path: library.into(),
            destination_path: destination,
            backup_path: backup.into(),
            zip_level: self.zip_level,
            case: self.case,
        }
    }

    /// Build and open the Location
    pub fn build(
        self,
        library: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        backup: impl Into<PathBuf>,
    ) -> Result<Location> {
        Location::open(self.config(library, destination, backup))
    }
}

impl Default for LocationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a package busy for as long as it lives
struct BusyGuard {
    busy: Arc<DashMap<Identity, ()>>,
    identity: Identity,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.remove(&self.identity);
    }
}

/// A transaction running on the blocking pool
#[derive(Debug)]
pub struct TransactionHandle<T> {
    identity: Identity,
    cancel: CancelToken,
    task: tokio::task::JoinHandle<Result<T>>,
}

impl<T> TransactionHandle<T> {
    /// Package the transaction runs against
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Ask the transaction to stop after the current item
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token shared with the running transaction
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether the transaction has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the transaction's result
    pub async fn wait(self) -> Result<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ModvaultError::TaskJoin(e.to_string())),
        }
    }
}

/// Registry of the packages of one library/destination/backup triple
#[derive(Debug)]
pub struct Location {
    config: RwLock<LocationConfig>,
    packages: RwLock<BTreeMap<Identity, PackageHandle>>,
    busy: Arc<DashMap<Identity, ()>>,
}

impl Location {
    /// Open a Location and discover its packages
    ///
    /// Creates the backup root if it does not exist yet. The library must
    /// exist; the destination may not (nothing installed yet).
    #[instrument(skip(config), fields(name = %config.name))]
    pub fn open(config: LocationConfig) -> Result<Self> {
        config.target()?;
        if !config.library_path.is_dir() {
            return Err(ModvaultError::InvalidConfiguration(format!(
                "library {:?} is not a directory",
                config.library_path
            )));
        }
        fs::create_dir_all(&config.backup_path)?;
        info!("Opening location {} at {:?}", config.name, config.destination_path);

        let location = Self {
            config: RwLock::new(config),
            packages: RwLock::new(BTreeMap::new()),
            busy: Arc::new(DashMap::new()),
        };
        location.refresh()?;
        Ok(location)
    }

    /// Current configuration
    pub fn config(&self) -> LocationConfig {
        self.config.read().clone()
    }

    /// Install target derived from the configuration
    pub fn target(&self) -> Result<InstallTarget> {
        self.config.read().target()
    }

    /// Rescan the library and backup root
    ///
    /// Sides are linked by identity. Packages with a running transaction are
    /// left untouched; packages that end up with neither side are dropped.
    #[instrument(skip(self))]
    pub fn refresh(&self) -> Result<()> {
        let config = self.config();
        let mut sources = scan_library(&config.library_path)?;
        let mut backups = scan_backups(&config.backup_path)?;

        let mut packages = self.packages.write();
        let identities: BTreeSet<Identity> = sources
            .keys()
            .chain(backups.keys())
            .chain(packages.keys())
            .copied()
            .collect();

        for identity in identities {
            if self.busy.contains_key(&identity) {
                debug!("Skipping busy package {}", identity);
                continue;
            }
            let source = sources.remove(&identity);
            let backup = backups.remove(&identity);
            if source.is_none() && backup.is_none() {
                if packages.remove(&identity).is_some() {
                    debug!("Dropped package {}: no source and no backup", identity);
                }
                continue;
            }

            match packages.get(&identity) {
                Some(handle) => {
                    if let Err(e) = handle.lock().set_sides(source, backup) {
                        warn!("Could not relink package {}: {}", identity, e);
                    }
                }
                None => match Package::from_sides(source, backup) {
                    Ok(package) => {
                        packages.insert(identity, Arc::new(Mutex::new(package)));
                    }
                    Err(e) => warn!("Could not register package {}: {}", identity, e),
                },
            }
        }

        info!(
            "Location {} has {} packages",
            config.name,
            packages.len()
        );
        Ok(())
    }

    fn handle(&self, identity: Identity) -> Result<PackageHandle> {
        self.packages
            .read()
            .get(&identity)
            .cloned()
            .ok_or_else(|| ModvaultError::PackageNotFound(identity.to_string()))
    }

    fn acquire(&self, identity: Identity) -> Result<BusyGuard> {
        let handle = self.handle(identity)?;
        match self.busy.entry(identity) {
            Entry::Occupied(_) => Err(ModvaultError::PackageBusy(handle.lock().name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(BusyGuard {
                    busy: Arc::clone(&self.busy),
                    identity,
                })
            }
        }
    }

    /// Whether a transaction is running against the package
    pub fn is_busy(&self, identity: Identity) -> bool {
        self.busy.contains_key(&identity)
    }

    /// Snapshot of one package
    pub fn get(&self, identity: Identity) -> Option<Package> {
        self.packages.read().get(&identity).map(|h| h.lock().clone())
    }

    /// Look a package up by identity hex or by name
    ///
    /// Names match exactly first, then case-insensitively.
    pub fn find(&self, query: &str) -> Option<Identity> {
        let packages = self.packages.read();
        if let Ok(identity) = query.parse::<Identity>() {
            if packages.contains_key(&identity) {
                return Some(identity);
            }
        }
        let by_name = Identity::from_name(query);
        if packages.contains_key(&by_name) {
            return Some(by_name);
        }
        packages
            .iter()
            .find(|(_, handle)| handle.lock().name().eq_ignore_ascii_case(query))
            .map(|(identity, _)| *identity)
    }

    /// Snapshots of every package, in identity order
    pub fn packages(&self) -> Vec<Package> {
        self.packages.read().values().map(|h| h.lock().clone()).collect()
    }

    /// Snapshots of every installed package
    pub fn installed(&self) -> Vec<Package> {
        self.packages
            .read()
            .values()
            .map(|h| h.lock().clone())
            .filter(Package::is_installed)
            .collect()
    }

    /// Replace a package's dependency identifiers
    pub fn set_dependencies<I, S>(&self, identity: Identity, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handle(identity)?.lock().set_dependencies(dependencies);
        Ok(())
    }

    /// Install a package into the destination
    pub fn install<F>(&self, identity: Identity, progress: F) -> Result<InstallReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let _guard = self.acquire(identity)?;
        self.install_guarded(identity, progress)
    }

    fn install_guarded<F>(&self, identity: Identity, progress: F) -> Result<InstallReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let handle = self.handle(identity)?;
        let target = self.target()?;
        let mut snapshot = handle.lock().clone();
        let result = snapshot.install(&target, self, progress);
        handle.lock().set_backup(snapshot.backup().cloned());
        result
    }

    /// Uninstall a package from the destination
    pub fn uninstall<F>(&self, identity: Identity, progress: F) -> Result<UninstallReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let _guard = self.acquire(identity)?;
        self.uninstall_guarded(identity, progress)
    }

    fn uninstall_guarded<F>(&self, identity: Identity, progress: F) -> Result<UninstallReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        let handle = self.handle(identity)?;
        let destination = self.config.read().destination_path.clone();
        let mut snapshot = handle.lock().clone();
        let result = snapshot.uninstall(&destination, progress);
        handle.lock().set_backup(snapshot.backup().cloned());
        if result.is_ok() && !snapshot.is_valid() {
            self.packages.write().remove(&identity);
            debug!("Dropped package {} after uninstall: no source left", identity);
        }
        result
    }

    /// Delete a package's backup without restoring the destination
    pub fn discard_backup(&self, identity: Identity) -> Result<()> {
        let _guard = self.acquire(identity)?;
        let handle = self.handle(identity)?;
        let mut snapshot = handle.lock().clone();
        snapshot.discard_backup()?;
        handle.lock().set_backup(None);
        if !snapshot.is_valid() {
            self.packages.write().remove(&identity);
        }
        Ok(())
    }

    /// Run an install on tokio's blocking pool
    ///
    /// Must be called from within a tokio runtime. `cancel` is polled between
    /// items and `notify` sees every progress report. The package is marked
    /// busy before this returns, so a second spawn fails immediately.
    pub fn spawn_install(
        self: &Arc<Self>,
        identity: Identity,
        cancel: CancelToken,
        notify: Option<ProgressCallback>,
    ) -> Result<TransactionHandle<InstallReport>> {
        let guard = self.acquire(identity)?;
        let progress = cancel.callback(notify);
        let location = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            location.install_guarded(identity, progress)
        });
        Ok(TransactionHandle {
            identity,
            cancel,
            task,
        })
    }

    /// Run an uninstall on tokio's blocking pool
    ///
    /// Same contract as [`Location::spawn_install`].
    pub fn spawn_uninstall(
        self: &Arc<Self>,
        identity: Identity,
        cancel: CancelToken,
        notify: Option<ProgressCallback>,
    ) -> Result<TransactionHandle<UninstallReport>> {
        let guard = self.acquire(identity)?;
        let progress = cancel.callback(notify);
        let location = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            location.uninstall_guarded(identity, progress)
        });
        Ok(TransactionHandle {
            identity,
            cancel,
            task,
        })
    }

    /// Installed packages whose backed-up files installing `identity` would overwrite
    pub fn overlapping(&self, identity: Identity) -> Result<BTreeSet<Identity>> {
        let package = self
            .get(identity)
            .ok_or_else(|| ModvaultError::PackageNotFound(identity.to_string()))?;
        let config = self.config();
        let footprint = package.footprint(&config.destination_path)?;
        Ok(find_overlaps(
            &footprint,
            &self.installed_backups(identity),
            config.case,
        ))
    }

    /// Move every backup store to `new_root`
    ///
    /// Progress is reported per store and `false` stops after the current one.
    /// The move is all or nothing: on abort or on any failure the stores
    /// already moved go back to the current root, so `refresh` still finds
    /// them. The configuration switches to the new root only once every
    /// store is there. `moved` lists the stores left in `new_root`.
    #[instrument(skip(self, progress))]
    pub fn relocate_backups<F>(&self, new_root: &Path, mut progress: F) -> Result<RelocateReport>
    where
        F: FnMut(&ProgressInfo) -> bool,
    {
        fs::create_dir_all(new_root)?;
        let old_root = self.config().backup_path;
        let installed: Vec<(Identity, PackageHandle)> = self
            .packages
            .read()
            .iter()
            .filter(|(_, handle)| handle.lock().is_installed())
            .map(|(identity, handle)| (*identity, Arc::clone(handle)))
            .collect();

        let mut report = RelocateReport::default();
        let mut info = ProgressInfo {
            operation: "relocate",
            current_item: None,
            processed: 0,
            total: installed.len(),
        };
        if !progress(&info) {
            report.aborted = true;
            return Ok(report);
        }

        for (index, (identity, handle)) in installed.iter().enumerate() {
            let mut snapshot = handle.lock().clone();
            let current = snapshot
                .backup()
                .map(|b| b.path.clone())
                .unwrap_or_default();

            if current.parent() != Some(new_root) {
                let outcome = self
                    .acquire(*identity)
                    .and_then(|_guard| snapshot.relocate_backup(new_root));
                match outcome {
                    Ok(()) => {
                        handle.lock().set_backup(snapshot.backup().cloned());
                        report.moved.push(*identity);
                    }
                    Err(e) => {
                        warn!("Could not move backup {:?}: {}", current, e);
                        report.failures.push(RestoreFailure::new(&current, e));
                    }
                }
            }

            info.processed = index + 1;
            info.current_item = Some(current);
            if !progress(&info) {
                report.aborted = true;
                break;
            }
        }

        if !report.aborted && report.failures.is_empty() {
            self.config.write().backup_path = new_root.to_path_buf();
        } else {
            self.move_back(&installed, &old_root, &mut report);
        }
        info!(
            "Moved {} backups to {:?} ({} failed{})",
            report.moved.len(),
            new_root,
            report.failures.len(),
            if report.aborted { ", aborted" } else { "" }
        );
        Ok(report)
    }

    /// Return the stores of an incomplete relocation to `old_root`
    fn move_back(
        &self,
        installed: &[(Identity, PackageHandle)],
        old_root: &Path,
        report: &mut RelocateReport,
    ) {
        let moved = std::mem::take(&mut report.moved);
        for identity in moved {
            let Some((_, handle)) = installed.iter().find(|(id, _)| *id == identity) else {
                continue;
            };
            let mut snapshot = handle.lock().clone();
            let outcome = self
                .acquire(identity)
                .and_then(|_guard| snapshot.relocate_backup(old_root));
            match outcome {
                Ok(()) => handle.lock().set_backup(snapshot.backup().cloned()),
                Err(e) => {
                    let path = snapshot.backup().map(|b| b.path.clone()).unwrap_or_default();
                    warn!("Could not move backup {:?} back: {}", path, e);
                    report.failures.push(RestoreFailure::new(&path, e));
                    report.moved.push(identity);
                }
            }
        }
    }

    /// Dependencies of `identity` that no installed package satisfies
    pub fn missing_dependencies(&self, identity: Identity) -> Result<Vec<String>> {
        let package = self
            .get(identity)
            .ok_or_else(|| ModvaultError::PackageNotFound(identity.to_string()))?;
        let installed = self.installed();
        Ok(package
            .dependencies()
            .iter()
            .filter(|dependency| !installed.iter().any(|p| satisfies(p, dependency)))
            .cloned()
            .collect())
    }

    /// Installed packages that depend on `identity`
    pub fn dependents(&self, identity: Identity) -> Result<Vec<Identity>> {
        let package = self
            .get(identity)
            .ok_or_else(|| ModvaultError::PackageNotFound(identity.to_string()))?;
        Ok(self
            .installed()
            .into_iter()
            .filter(|p| p.identity() != identity)
            .filter(|p| p.dependencies().iter().any(|d| satisfies(&package, d)))
            .map(|p| p.identity())
            .collect())
    }

    /// Installed older version that `identity` would replace
    pub fn installed_predecessor(&self, identity: Identity) -> Result<Option<Identity>> {
        let package = self
            .get(identity)
            .ok_or_else(|| ModvaultError::PackageNotFound(identity.to_string()))?;
        Ok(self
            .installed()
            .into_iter()
            .filter(|p| package.is_upgrade_of(p))
            .max_by(|a, b| a.version().cmp(&b.version()))
            .map(|p| p.identity()))
    }
}

impl InstalledBackups for Location {
    fn installed_backups(&self, exclude: Identity) -> Vec<(Identity, ItemSet)> {
        self.packages
            .read()
            .iter()
            .filter(|(identity, _)| **identity != exclude)
            .filter_map(|(identity, handle)| {
                handle
                    .lock()
                    .backup()
                    .map(|backup| (*identity, backup.items.clone()))
            })
            .collect()
    }
}

fn satisfies(package: &Package, dependency: &str) -> bool {
    version::same_core_name(dependency, &package.core_name())
        || version::same_core_name(dependency, package.name())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true)
}

/// Scan the library for folders and package archives
fn scan_library(library: &Path) -> Result<BTreeMap<Identity, SourceSide>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(library)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| !is_hidden(path))
        .filter(|path| path.is_dir() || (path.is_file() && identity::is_archive_path(path)))
        .collect();
    paths.sort();

    let scanned: Vec<(PathBuf, Result<SourceSide>)> = paths
        .into_par_iter()
        .map(|path| {
            let side = SourceSide::scan(&path);
            (path, side)
        })
        .collect();

    let mut sources = BTreeMap::new();
    for (path, side) in scanned {
        match side {
            Ok(side) => {
                let identity = side.identity();
                if let Some(existing) = sources.get(&identity).map(|s: &SourceSide| s.root.clone()) {
                    warn!("{:?} has the same name as {:?}; ignoring it", path, existing);
                } else {
                    sources.insert(identity, side);
                }
            }
            Err(e) => warn!("Skipping library entry {:?}: {}", path, e),
        }
    }
    debug!("Library {:?}: {} sources", library, sources.len());
    Ok(sources)
}

/// Scan the backup root for stores
fn scan_backups(root: &Path) -> Result<BTreeMap<Identity, BackupSide>> {
    let mut backups = BTreeMap::new();
    if !root.is_dir() {
        return Ok(backups);
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| !is_hidden(path) && backup::looks_like_store(path))
        .collect();
    paths.sort();

    for path in paths {
        let loaded = BackupSide::load(&path).and_then(|side| Ok((side.identity()?, side)));
        match loaded {
            Ok((identity, side)) => {
                if backups.contains_key(&identity) {
                    warn!("Duplicate backup {:?}; ignoring it", path);
                } else {
                    backups.insert(identity, side);
                }
            }
            Err(e) => warn!("Skipping backup {:?}: {}", path, e),
        }
    }
    debug!("Backup root {:?}: {} stores", root, backups.len());
    Ok(backups)
}
