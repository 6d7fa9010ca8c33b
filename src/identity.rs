//! Package identity
//!
//! A package is identified by a 64-bit hash of its *name*, the source or
//! backup filename without path or extension. Content never enters the hash:
//! two archives with the same bytes but different names are different
//! packages, and renaming a source file detaches it from the backup that was
//! made under the old name.
//!
//! The hash is XXH3-64 over the UTF-16LE encoding of the name. It is stable
//! across runs and platforms, which is what keeps a backup written today
//! linkable to its source after a restart.

use crate::error::{ModvaultError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_64;

/// Archive extensions recognised as package sources
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "ozp"];

/// Hash arbitrary bytes into a stable 64-bit value
pub fn hash64(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Deterministic identity of a package, derived from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(u64);

impl Identity {
    /// Identity of a package called `name`
    ///
    /// ```
    /// use modvault::Identity;
    ///
    /// assert_eq!(Identity::from_name("MyMod_v1.0"), Identity::from_name("MyMod_v1.0"));
    /// assert_ne!(Identity::from_name("MyMod_v1.0"), Identity::from_name("MyMod_v1.1"));
    /// ```
    pub fn from_name(name: &str) -> Self {
        let utf16: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
        Identity(hash64(&utf16))
    }

    /// Identity of the package stored at `path`
    ///
    /// See [`package_name`] for how the name is taken from the path.
    pub fn from_path(path: &Path) -> Result<Self> {
        Ok(Self::from_name(&package_name(path)?))
    }

    /// Raw hash value
    pub fn value(self) -> u64 {
        self.0
    }

    /// Parse the 16 hex digit form produced by `Display`
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| ModvaultError::InvalidPackage(format!("bad identity {:?}: {}", hex_str, e)))?;
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
            ModvaultError::InvalidPackage(format!("identity {:?} is not 8 bytes", hex_str))
        })?;
        Ok(Identity(u64::from_be_bytes(bytes)))
    }
}

impl From<u64> for Identity {
    fn from(value: u64) -> Self {
        Identity(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0.to_be_bytes()))
    }
}

impl FromStr for Identity {
    type Err = ModvaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Whether `path` names a package archive (by extension only)
pub fn is_archive_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ARCHIVE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Package name for a source or backup path
///
/// Archives (and zip backups) drop their extension; folders keep their full
/// name, dots included, so `Mod.v2/` and `Mod.v2.zip` share a name.
pub fn package_name(path: &Path) -> Result<String> {
    let name = if is_archive_path(path) {
        path.file_stem()
    } else {
        path.file_name()
    };
    name.and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ModvaultError::InvalidPackage(format!("no usable name in {:?}", path)))
}
