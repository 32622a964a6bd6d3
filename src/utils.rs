//! Utility functions for schema-warden
//!
//! Version coercion and identifier checks shared by the strategy tables and
//! the orchestrators.

use crate::error::{Result, WardenError};
use regex::Regex;
use semver::{Version, VersionReq};

/// Smallest embedding dimension accepted for a vector column
pub const MIN_DIMENSION: i32 = 1;

/// Largest embedding dimension accepted for a vector column
pub const MAX_DIMENSION: i32 = 1 << 16;

/// Coerce a loose version string into a semantic version
///
/// Extension catalogs report versions such as `0.3`, `1.0.0` or
/// `16.4 (Debian 16.4-1.pgdg120+1)`. The first `major[.minor[.patch]]` group
/// found in the text is used and missing components default to zero.
pub fn coerce_version(raw: &str) -> Result<Version> {
    let pattern = Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?")?;
    let captures = pattern
        .captures(raw)
        .ok_or_else(|| WardenError::Precondition(format!("No version number in '{}'", raw)))?;

    let component = |index: usize| -> Result<u64> {
        match captures.get(index) {
            Some(m) => m
                .as_str()
                .parse::<u64>()
                .map_err(|e| WardenError::Precondition(format!("Bad version '{}': {}", raw, e))),
            None => Ok(0),
        }
    };

    Ok(Version::new(component(1)?, component(2)?, component(3)?))
}

/// Check a loose version string against a requirement
pub fn satisfies(raw: &str, range: &VersionReq) -> Result<bool> {
    Ok(range.matches(&coerce_version(raw)?))
}

/// Reject anything that is not a plain lower/upper-case SQL identifier
///
/// Table and index names are spliced into DDL text, so only
/// `[A-Za-z_][A-Za-z0-9_]*` up to 63 bytes is accepted.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let pattern = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")?;
    if pattern.is_match(name) {
        Ok(name)
    } else {
        Err(WardenError::Config(format!("Invalid SQL identifier: '{}'", name)))
    }
}

/// Whether a column type modifier is a usable embedding dimension
pub fn is_valid_dimension(dimension: i32) -> bool {
    (MIN_DIMENSION..=MAX_DIMENSION).contains(&dimension)
}
