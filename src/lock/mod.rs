//! Named locks for schema-mutating operations
//!
//! Each lock has a string key for logs and the in-process mutex, and an
//! advisory-lock id shared by every process on the database. The ids are a
//! wire contract between releases: never renumber them.

pub mod coordinator;

pub use coordinator::{LockCoordinator, LockGuard};

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedLock {
    /// Schema migrations and bootstrap
    Migrations,
    /// `ALTER EXTENSION ... UPDATE`
    ExtensionUpgrade,
    /// Rebuild of the CLIP embedding index
    ClipIndex,
    /// Rebuild of the face embedding index
    FaceIndex,
}

impl NamedLock {
    pub const COUNT: usize = 4;

    pub const ALL: [NamedLock; NamedLock::COUNT] = [
        NamedLock::Migrations,
        NamedLock::ExtensionUpgrade,
        NamedLock::ClipIndex,
        NamedLock::FaceIndex,
    ];

    /// Key of the in-process mutex
    pub fn key(self) -> &'static str {
        match self {
            NamedLock::Migrations => "migrations",
            NamedLock::ExtensionUpgrade => "extension_upgrade",
            NamedLock::ClipIndex => "clip_index",
            NamedLock::FaceIndex => "face_index",
        }
    }

    /// Advisory lock id
    pub fn id(self) -> i64 {
        match self {
            NamedLock::Migrations => 200,
            NamedLock::ExtensionUpgrade => 210,
            NamedLock::ClipIndex => 512,
            NamedLock::FaceIndex => 513,
        }
    }

    /// Position in [`NamedLock::ALL`]
    pub(crate) fn ordinal(self) -> usize {
        match self {
            NamedLock::Migrations => 0,
            NamedLock::ExtensionUpgrade => 1,
            NamedLock::ClipIndex => 2,
            NamedLock::FaceIndex => 3,
        }
    }
}

impl fmt::Display for NamedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for NamedLock {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        NamedLock::ALL
            .into_iter()
            .find(|lock| lock.key() == wanted)
            .ok_or_else(|| WardenError::Config(format!("Unknown lock: '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_advisory_ids_are_injective() {
        let ids: HashSet<i64> = NamedLock::ALL.iter().map(|lock| lock.id()).collect();
        assert_eq!(ids.len(), NamedLock::ALL.len());

        let keys: HashSet<&str> = NamedLock::ALL.iter().map(|lock| lock.key()).collect();
        assert_eq!(keys.len(), NamedLock::ALL.len());
    }

    #[test]
    fn test_advisory_ids_are_stable() {
        assert_eq!(NamedLock::Migrations.id(), 200);
        assert_eq!(NamedLock::ExtensionUpgrade.id(), 210);
        assert_eq!(NamedLock::ClipIndex.id(), 512);
        assert_eq!(NamedLock::FaceIndex.id(), 513);
    }

    #[test]
    fn test_ordinal_matches_position() {
        for (position, lock) in NamedLock::ALL.iter().enumerate() {
            assert_eq!(lock.ordinal(), position);
        }
    }

    #[test]
    fn test_parse_lock() {
        assert_eq!("clip-index".parse::<NamedLock>().unwrap(), NamedLock::ClipIndex);
        assert_eq!("Migrations".parse::<NamedLock>().unwrap(), NamedLock::Migrations);
        assert!("library".parse::<NamedLock>().is_err());
    }
}
