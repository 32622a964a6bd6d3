//! Vector indexes managed by schema-warden

pub mod reindex;

pub use reindex::ReindexOrchestrator;

use crate::error::{Result, WardenError};
use crate::extension::strategy::EMBEDDING_COLUMN;
use crate::lock::NamedLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A known embedding index, bound to one table and column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorIndex {
    /// CLIP embeddings of assets
    Clip,
    /// Face embeddings
    Face,
}

impl VectorIndex {
    pub const ALL: [VectorIndex; 2] = [VectorIndex::Clip, VectorIndex::Face];

    pub fn name(self) -> &'static str {
        match self {
            VectorIndex::Clip => "clip_index",
            VectorIndex::Face => "face_index",
        }
    }

    /// Table the index is declared on
    pub fn table(self) -> &'static str {
        match self {
            VectorIndex::Clip => "smart_search",
            VectorIndex::Face => "face_search",
        }
    }

    pub fn column(self) -> &'static str {
        EMBEDDING_COLUMN
    }

    /// Lock guarding rebuilds of this index
    pub fn lock(self) -> NamedLock {
        match self {
            VectorIndex::Clip => NamedLock::ClipIndex,
            VectorIndex::Face => NamedLock::FaceIndex,
        }
    }
}

impl fmt::Display for VectorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VectorIndex {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        VectorIndex::ALL
            .into_iter()
            .find(|index| index.name() == wanted || index.name().trim_end_matches("_index") == wanted)
            .ok_or_else(|| WardenError::Config(format!("Unknown vector index: '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings() {
        assert_eq!(VectorIndex::Clip.table(), "smart_search");
        assert_eq!(VectorIndex::Face.table(), "face_search");
        assert_eq!(VectorIndex::Clip.column(), "embedding");
        assert_ne!(VectorIndex::Clip.lock(), VectorIndex::Face.lock());
    }

    #[test]
    fn test_parse_index() {
        assert_eq!("clip_index".parse::<VectorIndex>().unwrap(), VectorIndex::Clip);
        assert_eq!("face".parse::<VectorIndex>().unwrap(), VectorIndex::Face);
        assert!("search_index".parse::<VectorIndex>().is_err());
    }
}
