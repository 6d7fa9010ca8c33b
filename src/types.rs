//! Core data types used throughout the modvault library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Item model**: `ItemEntry`, `ItemSet`, `Footprint` - what a package puts
//!   where and what must happen to it on uninstall
//! - **Progress**: `ProgressInfo`, `CancelToken` - reporting and cooperative
//!   cancellation of long-running transactions
//! - **Configuration**: `LocationConfig`, `BackupMode`, `PathCase`
//! - **Results**: `InstallReport`, `UninstallReport`, `RelocateReport`
//!
//! ## Examples
//!
//! ```rust
//! use modvault::types::{ItemEntry, ItemSet};
//!
//! let mut items = ItemSet::new();
//! items.push(ItemEntry::file("sub/b.txt"));
//! items.push(ItemEntry::directory("sub"));
//! items.push(ItemEntry::file("a.txt"));
//! items.sort_install_order();
//!
//! let paths: Vec<_> = items.iter().map(|e| e.path.to_str().unwrap()).collect();
//! assert_eq!(paths, ["a.txt", "sub", "sub/b.txt"]);
//! ```

use crate::error::{ModvaultError, Result, RestoreFailure};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether an entry is a regular file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// What install did to an entry, and therefore what uninstall must do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemDisposition {
    /// Not yet evaluated (source side), or a pre-existing directory that is left alone
    #[default]
    None,
    /// Something existed at the destination and was preserved before being overwritten
    CopyOverwrite,
    /// Nothing existed at the destination; uninstall removes the entry
    DeleteOnUninstall,
}

/// One file or directory of a package, relative to the destination root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemEntry {
    /// File or directory
    pub kind: ItemKind,
    /// Install/uninstall disposition
    pub disposition: ItemDisposition,
    /// Index in the source zip central directory, when the source is an archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_index: Option<usize>,
    /// Path relative to the destination root
    pub path: PathBuf,
}

impl ItemEntry {
    /// File entry with no disposition
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ItemKind::File,
            disposition: ItemDisposition::None,
            zip_index: None,
            path: path.into(),
        }
    }

    /// Directory entry with no disposition
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ItemKind::Directory,
            ..Self::file(path)
        }
    }

    /// Builder-style zip index
    pub fn with_zip_index(mut self, index: usize) -> Self {
        self.zip_index = Some(index);
        self
    }

    /// Builder-style disposition
    pub fn with_disposition(mut self, disposition: ItemDisposition) -> Self {
        self.disposition = disposition;
        self
    }

    /// Whether this is a file entry
    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }

    /// Whether this is a directory entry
    pub fn is_directory(&self) -> bool {
        self.kind == ItemKind::Directory
    }
}

/// Ordered list of package entries
///
/// Install order puts every directory before the entries it contains;
/// uninstall walks the same list backwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemSet {
    entries: Vec<ItemEntry>,
}

/// The simulated result of installing an item set against the live destination
pub type Footprint = ItemSet;

impl ItemSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, entry: ItemEntry) {
        self.entries.push(entry);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in install order
    pub fn iter(&self) -> std::slice::Iter<'_, ItemEntry> {
        self.entries.iter()
    }

    /// Entries as a slice
    pub fn as_slice(&self) -> &[ItemEntry] {
        &self.entries
    }

    /// File entries only
    pub fn files(&self) -> impl Iterator<Item = &ItemEntry> {
        self.entries.iter().filter(|e| e.is_file())
    }

    /// Number of file entries
    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    /// Entries with the given disposition
    pub fn with_disposition(&self, disposition: ItemDisposition) -> impl Iterator<Item = &ItemEntry> {
        self.entries.iter().filter(move |e| e.disposition == disposition)
    }

    /// Look up an entry by exact relative path
    pub fn get(&self, path: &Path) -> Option<&ItemEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Whether an entry with this exact relative path exists
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Sort so that directories precede their contents
    ///
    /// `Path` ordering is component-wise, so a parent always sorts before
    /// anything below it.
    pub fn sort_install_order(&mut self) {
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
        self.entries.dedup_by(|a, b| a.path == b.path);
    }

    /// Keep only entries matching the predicate
    pub fn retain(&mut self, keep: impl FnMut(&ItemEntry) -> bool) {
        self.entries.retain(keep);
    }

    /// Check that every path is relative and stays below the root
    pub fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            if !crate::utils::is_safe_relative(&entry.path) {
                return Err(ModvaultError::InvalidPackage(format!(
                    "unsafe item path {:?}",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

impl FromIterator<ItemEntry> for ItemSet {
    fn from_iter<I: IntoIterator<Item = ItemEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ItemSet {
    type Item = ItemEntry;
    type IntoIter = std::vec::IntoIter<ItemEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ItemSet {
    type Item = &'a ItemEntry;
    type IntoIter = std::slice::Iter<'a, ItemEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Path comparison rule for overlap detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathCase {
    /// Exact comparison
    Sensitive,
    /// ASCII and Unicode lowercase folding before comparison
    Insensitive,
}

impl PathCase {
    /// Rule of the platform's usual filesystem
    pub fn native() -> Self {
        if cfg!(any(windows, target_os = "macos")) {
            PathCase::Insensitive
        } else {
            PathCase::Sensitive
        }
    }
}

impl Default for PathCase {
    fn default() -> Self {
        Self::native()
    }
}

/// How a Location persists backups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    /// Mirrored folder `<name>/`
    Folder,
    /// Zip archive `<name>.zip`; level 0 stores, 1..=9 deflates
    Zip {
        /// Compression level
        level: u8,
    },
}

impl BackupMode {
    /// Highest accepted zip level
    pub const MAX_ZIP_LEVEL: i32 = 9;

    /// Map the configured `zip_level` (-1 for folder mode)
    pub fn from_zip_level(level: i32) -> Result<Self> {
        match level {
            -1 => Ok(BackupMode::Folder),
            0..=Self::MAX_ZIP_LEVEL => Ok(BackupMode::Zip { level: level as u8 }),
            other => Err(ModvaultError::InvalidConfiguration(format!(
                "zip level {} is outside -1..={}",
                other,
                Self::MAX_ZIP_LEVEL
            ))),
        }
    }

    /// Configured `zip_level` equivalent
    pub fn zip_level(self) -> i32 {
        match self {
            BackupMode::Folder => -1,
            BackupMode::Zip { level } => level as i32,
        }
    }
}

/// Where an install writes and where its backup goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    /// Destination root the package is installed into
    pub destination: PathBuf,
    /// Directory holding backup stores
    pub backup_root: PathBuf,
    /// Backup persistence mode
    pub mode: BackupMode,
    /// Path comparison rule for overlaps
    pub case: PathCase,
}

/// Configuration of a Location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Display name
    pub name: String,
    /// Directory holding package sources (folders and archives)
    pub library_path: PathBuf,
    /// Destination root packages are installed into
    pub destination_path: PathBuf,
    /// Directory holding backup stores
    pub backup_path: PathBuf,
    /// -1 for folder backups, 0..=9 for zip backups
    pub zip_level: i32,
    /// Path comparison rule for overlaps
    #[serde(default)]
    pub case: PathCase,
}

impl LocationConfig {
    /// Install target derived from this configuration
    pub fn target(&self) -> Result<InstallTarget> {
        Ok(InstallTarget {
            destination: self.destination_path.clone(),
            backup_root: self.backup_path.clone(),
            mode: BackupMode::from_zip_level(self.zip_level)?,
            case: self.case,
        })
    }
}

/// Information passed to progress callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: &'static str,
    /// Item just processed, `None` for the initial call
    pub current_item: Option<PathBuf>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process
    pub total: usize,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        if self.total > 0 {
            Some((self.processed as f32 / self.total as f32) * 100.0)
        } else {
            None
        }
    }
}

/// Notification-only progress callback for background tasks
pub type ProgressCallback = Arc<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Cooperative cancellation flag shared with a running transaction
///
/// Checked between items, never in the middle of a file copy.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Progress callback that forwards to `notify` and continues until cancelled
    pub fn callback(
        &self,
        notify: Option<ProgressCallback>,
    ) -> impl FnMut(&ProgressInfo) -> bool + Send + 'static {
        let token = self.clone();
        move |info| {
            if let Some(notify) = &notify {
                notify(info);
            }
            !token.is_cancelled()
        }
    }
}

/// Result of a successful install
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Installed package
    pub identity: Identity,
    /// Files written to the destination
    pub files_installed: usize,
    /// Directories created in the destination
    pub directories_created: usize,
    /// Pre-existing files preserved in the backup
    pub files_backed_up: usize,
    /// Bytes written to the destination
    pub bytes_written: u64,
    /// Persisted backup store
    pub backup_path: PathBuf,
    /// Installed packages whose backed-up files this install overwrote
    pub overlaps: BTreeSet<Identity>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Result of a complete uninstall
#[derive(Debug, Clone, Default)]
pub struct UninstallReport {
    /// Files copied back from the backup
    pub files_restored: usize,
    /// Files deleted because nothing existed before install
    pub files_deleted: usize,
    /// Empty directories removed
    pub directories_removed: usize,
    /// Directories kept because they still hold other files
    pub directories_kept: usize,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// Result of moving backups to a new root
#[derive(Debug, Clone, Default)]
pub struct RelocateReport {
    /// Packages whose store was moved
    pub moved: Vec<Identity>,
    /// Stores that could not be moved
    pub failures: Vec<RestoreFailure>,
    /// Whether the callback stopped the operation early
    pub aborted: bool,
}
