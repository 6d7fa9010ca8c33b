//! # Modvault - Reversible package installs
//!
//! A library for installing packages (folders or zip archives) into a shared
//! destination tree in a way that can always be undone.
//!
//! ## Overview
//!
//! Modvault lets you:
//! - Compute what an install *would* do before doing it (the footprint)
//! - Install a package transactionally: any failure or cancellation rolls the
//!   destination back to exactly what it was
//! - Keep a backup of everything an install overwrote, as a zip or a folder
//! - Uninstall later, even after a restart, restoring the original files
//! - Detect when one package overwrites files another installed package owns
//!
//! ## Architecture
//!
//! - **Identity**: every package is known by a 64-bit hash of its name, so a
//!   library source and its backup link up without any registry file
//! - **Footprint**: a pure simulation of an install against the live
//!   destination, marking each entry `CopyOverwrite` (something is there and
//!   gets preserved) or `DeleteOnUninstall` (nothing is there)
//! - **Backup stores**: `<name>.zip` or `<name>/` in the backup root, each with
//!   a `backup.json` manifest and the preserved files
//! - **Journaled transactions**: install records an undo step before every
//!   mutation; uninstall collects per-entry failures and stays retryable
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modvault::LocationBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let location = LocationBuilder::new()
//!     .zip_level(6)
//!     .build("./library", "./game", "./backups")?;
//!
//! let id = location.find("Better Textures v1.2").expect("package in library");
//!
//! // See which installed packages this one would overwrite
//! for other in location.overlapping(id)? {
//!     println!("overwrites files of {}", other);
//! }
//!
//! let report = location.install(id, |progress| {
//!     println!("{}/{}", progress.processed, progress.total);
//!     true // return false to cancel and roll back
//! })?;
//! println!("Installed {} files, backed up {}", report.files_installed, report.files_backed_up);
//!
//! location.uninstall(id, |_| true)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Working with a single package
//!
//! ```rust,no_run
//! use modvault::{BackupMode, InstallTarget, ItemSet, Identity, Package, PathCase};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut package = Package::from_source(Path::new("./library/MyMod.zip"))?;
//! let target = InstallTarget {
//!     destination: PathBuf::from("./game"),
//!     backup_root: PathBuf::from("./backups"),
//!     mode: BackupMode::Folder,
//!     case: PathCase::native(),
//! };
//!
//! let footprint = package.footprint(&target.destination)?;
//! println!("{} entries", footprint.len());
//!
//! let nothing_installed: Vec<(Identity, ItemSet)> = Vec::new();
//! package.install(&target, &nothing_installed, |_| true)?;
//! package.uninstall(&target.destination, |_| true)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, ModvaultError>`. Transaction errors name
//! the offending path relative to the destination root; see
//! [`ModvaultError::user_message`] for end-user wording.
//!
//! ## Module Organization
//!
//! - [`location`]: Package registry, background transactions, relocation
//! - [`package`]: Package model with source and backup sides
//! - [`install`] / [`uninstall`]: The two transactions
//! - [`footprint`]: Source scanning and footprint computation
//! - [`overlap`]: Overlap detection between packages
//! - [`backup`]: Backup store layout and manifest
//! - [`identity`] / [`version`]: Naming, hashing and version parsing
//! - [`types`]: Common types and data structures
//! - [`error`]: Error types and handling

// Public API modules
pub mod backup;
pub mod error;
pub mod footprint;
pub mod identity;
pub mod install;
pub mod location;
pub mod overlap;
pub mod package;
pub mod types;
pub mod uninstall;
pub mod utils;
pub mod version;

// Re-export main types for convenience
pub use backup::{BackupManifest, BackupStore};
pub use error::{ModvaultError, RestoreFailure, Result};
pub use footprint::compute_footprint;
pub use identity::Identity;
pub use location::{Location, LocationBuilder, TransactionHandle};
pub use overlap::{detect_overlap, InstalledBackups};
pub use package::{Package, PackageSide};
pub use types::*;
