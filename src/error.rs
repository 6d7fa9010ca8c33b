//! Error types for the modvault engine
//!
//! Every failure that can reach a caller is a [`ModvaultError`]. Transaction
//! errors always carry the offending path relative to the destination root so
//! they can be shown to an end user without further lookup.

use crate::identity::Identity;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Type alias for Results in the modvault library
pub type Result<T> = std::result::Result<T, ModvaultError>;

/// One entry that could not be restored, deleted or reverted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreFailure {
    /// Path relative to the destination root
    pub path: PathBuf,
    /// Human readable cause
    pub reason: String,
}

impl RestoreFailure {
    /// Create a failure record for `path`
    pub fn new(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for RestoreFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.reason)
    }
}

fn list_failures(failures: &[RestoreFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn aborted_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" after {}", path.display()),
        None => String::new(),
    }
}

/// Main error type for all modvault operations
#[derive(Debug, Error)]
pub enum ModvaultError {
    /// I/O errors outside of a transaction's per-item handling
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors from the zip codec
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// A source item vanished or became unreadable after the footprint was computed
    #[error("Source item unavailable: {}", .path.display())]
    SourceUnavailable {
        /// Item path relative to the destination root
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// The destination (or the backup staging area) could not be written
    #[error("Cannot write {}: {source}", .path.display())]
    DestinationWrite {
        /// Item path relative to the destination root
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// The progress callback asked to stop
    #[error("Operation aborted{}", aborted_suffix(.path))]
    Aborted {
        /// Last item processed before the abort, if any
        path: Option<PathBuf>,
    },

    /// A backup store or one of its entries is unreadable or inconsistent
    #[error("Backup corrupt at {}: {reason}", .path.display())]
    BackupCorrupt {
        /// Store path, or item path relative to the destination root
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// Uninstall finished but some entries could not be restored or deleted
    #[error("{} item(s) could not be restored: {}", .failures.len(), list_failures(.failures))]
    PartialRestore {
        /// Every entry that failed
        failures: Vec<RestoreFailure>,
    },

    /// An install failed and its rollback could not revert every entry
    #[error("Rollback incomplete after \"{cause}\": {}", list_failures(.failures))]
    RollbackIncomplete {
        /// The error that triggered the rollback
        cause: Box<ModvaultError>,
        /// Entries left in their post-install state
        failures: Vec<RestoreFailure>,
    },

    /// No package with this identity or name
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Another transaction is running against this package
    #[error("Package is busy: {0}")]
    PackageBusy(String),

    /// The package has no source side to install from
    #[error("Package has no source: {0}")]
    MissingSource(String),

    /// The package has no backup side to uninstall
    #[error("Package is not installed: {0}")]
    NotInstalled(String),

    /// The package already has a backup side
    #[error("Package is already installed: {0}")]
    AlreadyInstalled(String),

    /// A backup store already exists where a new one would be written
    #[error("Backup already exists: {}", .0.display())]
    BackupExists(PathBuf),

    /// A side or manifest belongs to another package
    #[error("Identity mismatch - expected: {expected}, actual: {actual}")]
    IdentityMismatch {
        /// Identity of the package
        expected: Identity,
        /// Identity found on disk
        actual: Identity,
    },

    /// Not a usable package source or backup
    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A background task panicked or was cancelled by the runtime
    #[error("Task join error: {0}")]
    TaskJoin(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModvaultError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ModvaultError::Internal(msg.into())
    }

    /// Create a backup corruption error
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        ModvaultError::BackupCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn source_unavailable(path: &Path, source: std::io::Error) -> Self {
        ModvaultError::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn destination_write(path: &Path, source: std::io::Error) -> Self {
        ModvaultError::DestinationWrite {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Check if this error ended an install attempt
    ///
    /// Fatal install errors are always followed by a full rollback.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ModvaultError::SourceUnavailable { .. }
                | ModvaultError::DestinationWrite { .. }
                | ModvaultError::RollbackIncomplete { .. }
        )
    }

    /// Check if retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ModvaultError::Aborted { .. }
                | ModvaultError::PackageBusy(_)
                | ModvaultError::PartialRestore { .. }
        )
    }

    /// Path the error is about, when there is exactly one
    pub fn offending_path(&self) -> Option<&Path> {
        match self {
            ModvaultError::SourceUnavailable { path, .. }
            | ModvaultError::DestinationWrite { path, .. }
            | ModvaultError::BackupCorrupt { path, .. }
            | ModvaultError::BackupExists(path) => Some(path),
            ModvaultError::Aborted { path } => path.as_deref(),
            ModvaultError::RollbackIncomplete { cause, .. } => cause.offending_path(),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ModvaultError::SourceUnavailable { path, .. } => format!(
                "The package file {:?} disappeared during install. The destination was restored; \
                 refresh the library and try again.",
                path
            ),
            ModvaultError::DestinationWrite { path, source } => format!(
                "Could not write {:?} ({}). Check free space and permissions; \
                 the destination was restored to its previous state.",
                path, source
            ),
            ModvaultError::Aborted { .. } => {
                "Operation cancelled. The destination was restored to its previous state.".to_string()
            }
            ModvaultError::PartialRestore { failures } => format!(
                "{} item(s) could not be restored and remain in the backup: {}. \
                 Fix the cause and uninstall again.",
                failures.len(),
                list_failures(failures)
            ),
            ModvaultError::PackageBusy(name) => {
                format!("'{}' is being installed or uninstalled. Try again later.", name)
            }
            _ => self.to_string(),
        }
    }
}
