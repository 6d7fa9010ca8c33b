//! Version and core name extraction from package names
//!
//! Mod archives usually carry their version in the filename, e.g.
//! `BetterTrees_v1.2.zip` or `Better Trees 1.2.3b.zip`. The trailing token
//! after the last space, underscore or dash is read as a version when it
//! looks like one; everything before it is the core name used to recognise
//! upgrades of the same mod.

use semver::{BuildMetadata, Version};

const SEPARATORS: &[char] = &[' ', '_', '-'];

/// Split a package name into its core name and parsed version
///
/// ```
/// use modvault::version::split_name;
///
/// let (core, version) = split_name("BetterTrees_v1.2");
/// assert_eq!(core, "BetterTrees");
/// assert_eq!(version.unwrap().to_string(), "1.2.0");
///
/// assert_eq!(split_name("BetterTrees"), ("BetterTrees".to_string(), None));
/// ```
pub fn split_name(name: &str) -> (String, Option<Version>) {
    let trimmed = name.trim();
    if let Some(pos) = trimmed.rfind(SEPARATORS) {
        let (head, token) = (&trimmed[..pos], &trimmed[pos + 1..]);
        let head = head.trim_end_matches(SEPARATORS).trim();
        if !head.is_empty() {
            if let Some(version) = parse_version(token) {
                return (head.to_string(), Some(version));
            }
        }
    }
    (trimmed.to_string(), None)
}

/// Leniently parse a version token
///
/// Accepts an optional `v` prefix, one to three numeric components, and
/// keeps any further components or a trailing letter suffix as build
/// metadata (`1.0.4b` → `1.0.4+b`).
pub fn parse_version(token: &str) -> Option<Version> {
    let token = token.strip_prefix(['v', 'V']).unwrap_or(token);
    let split = token
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(token.len());
    let (numeric, suffix) = token.split_at(split);

    if numeric.is_empty() || numeric.starts_with('.') || numeric.ends_with('.') {
        return None;
    }
    if !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    let mut parts = Vec::new();
    for part in numeric.split('.') {
        parts.push(part.parse::<u64>().ok()?);
    }

    let mut version = Version::new(
        parts[0],
        parts.get(1).copied().unwrap_or(0),
        parts.get(2).copied().unwrap_or(0),
    );

    let mut build: Vec<String> = parts.iter().skip(3).map(u64::to_string).collect();
    if !suffix.is_empty() {
        build.push(suffix.to_string());
    }
    if !build.is_empty() {
        version.build = BuildMetadata::new(&build.join(".")).ok()?;
    }
    Some(version)
}

/// Compare core names the way upgrades are matched
pub fn same_core_name(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}
