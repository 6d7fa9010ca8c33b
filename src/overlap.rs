//! Overlap detection between a candidate install and installed backups
//!
//! Package P overlaps installed package Q when installing P would overwrite a
//! file that Q's backup already accounts for. Overlaps are advisory: they feed
//! user warnings and tell which uninstall order restores what, but they never
//! block an operation.
//!
//! The relation is directional. `detect_overlap(P.footprint, Q.backup)` and
//! `detect_overlap(Q.footprint, P.backup)` answer different questions and may
//! disagree.

use crate::identity::Identity;
use crate::types::{Footprint, ItemDisposition, ItemSet, PathCase};
use crate::utils::path_key;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Cross-package lookup capability handed to operations that need it
///
/// Implemented by [`crate::Location`]; a plain slice of pairs works in tests.
pub trait InstalledBackups {
    /// Identity and backup items of every installed package except `exclude`
    fn installed_backups(&self, exclude: Identity) -> Vec<(Identity, ItemSet)>;
}

impl InstalledBackups for [(Identity, ItemSet)] {
    fn installed_backups(&self, exclude: Identity) -> Vec<(Identity, ItemSet)> {
        self.iter()
            .filter(|(identity, _)| *identity != exclude)
            .cloned()
            .collect()
    }
}

impl InstalledBackups for Vec<(Identity, ItemSet)> {
    fn installed_backups(&self, exclude: Identity) -> Vec<(Identity, ItemSet)> {
        self.as_slice().installed_backups(exclude)
    }
}

/// Whether installing `candidate` overwrites a file recorded in `backup`
///
/// Only `CopyOverwrite` files of the candidate count, and only file entries
/// of the backup; directories never overlap.
pub fn detect_overlap(candidate: &Footprint, backup: &ItemSet, case: PathCase) -> bool {
    let backed_up: HashSet<String> = backup.files().map(|e| path_key(&e.path, case)).collect();
    if backed_up.is_empty() {
        return false;
    }
    candidate
        .with_disposition(ItemDisposition::CopyOverwrite)
        .filter(|e| e.is_file())
        .any(|e| backed_up.contains(&path_key(&e.path, case)))
}

/// Identities of every installed package the candidate overlaps
pub fn find_overlaps(
    candidate: &Footprint,
    installed: &[(Identity, ItemSet)],
    case: PathCase,
) -> BTreeSet<Identity> {
    let overlaps: BTreeSet<Identity> = installed
        .par_iter()
        .filter(|(_, backup)| detect_overlap(candidate, backup, case))
        .map(|(identity, _)| *identity)
        .collect();
    debug!(
        "Checked footprint of {} entries against {} installed packages: {} overlaps",
        candidate.len(),
        installed.len(),
        overlaps.len()
    );
    overlaps
}
