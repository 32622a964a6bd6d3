//! Database extensions and their per-extension strategy tables
//!
//! Every vector extension has exactly one [`VectorProfile`] row. Adding a new
//! vector extension means adding a variant and a row; the strategy functions,
//! version ranges and upgrade logic all read from the table.

pub mod strategy;
pub mod upgrade;
pub mod version;

pub use strategy::{create_index_statement, needs_reindex};
pub use upgrade::{ExtensionUpgradeOrchestrator, VectorUpgradeResult};
pub use version::{VersionDiff, VersionResolver, version_diff};

use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Engine extensions known to the schema manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseExtension {
    /// `cube`, used by geodata lookups
    Cube,
    /// `earthdistance`, used by geodata lookups
    EarthDistance,
    /// pgvector: native `vector` type, HNSW index
    Vector,
    /// pgvecto.rs: legacy `vectors.vector` type
    Vectors,
    /// VectorChord: partitioned-cluster `vchordrq` index
    #[serde(rename = "vchord")]
    VectorChord,
}

impl DatabaseExtension {
    pub const ALL: [DatabaseExtension; 5] = [
        DatabaseExtension::Cube,
        DatabaseExtension::EarthDistance,
        DatabaseExtension::Vector,
        DatabaseExtension::Vectors,
        DatabaseExtension::VectorChord,
    ];

    /// Vector extensions in detection preference order
    pub const VECTOR: [DatabaseExtension; 3] = [
        DatabaseExtension::VectorChord,
        DatabaseExtension::Vectors,
        DatabaseExtension::Vector,
    ];

    /// Name of the extension in `pg_extension`
    pub fn name(self) -> &'static str {
        match self {
            DatabaseExtension::Cube => "cube",
            DatabaseExtension::EarthDistance => "earthdistance",
            DatabaseExtension::Vector => "vector",
            DatabaseExtension::Vectors => "vectors",
            DatabaseExtension::VectorChord => "vchord",
        }
    }

    /// Human-readable product name for log and error messages
    pub fn display_name(self) -> &'static str {
        match self {
            DatabaseExtension::Cube => "cube",
            DatabaseExtension::EarthDistance => "earthdistance",
            DatabaseExtension::Vector => "pgvector",
            DatabaseExtension::Vectors => "pgvecto.rs",
            DatabaseExtension::VectorChord => "VectorChord",
        }
    }

    pub fn is_vector(self) -> bool {
        VECTOR_PROFILES.iter().any(|p| p.extension == self)
    }

    /// Strategy row for a vector extension
    ///
    /// Non-vector extensions have no row and are a configuration error.
    pub fn vector_profile(self) -> Result<&'static VectorProfile> {
        VECTOR_PROFILES
            .iter()
            .find(|p| p.extension == self)
            .ok_or_else(|| {
                WardenError::Config(format!(
                    "Unsupported vector extension: {}",
                    self.display_name()
                ))
            })
    }
}

impl fmt::Display for DatabaseExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatabaseExtension {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        match wanted.as_str() {
            "pgvector" => return Ok(DatabaseExtension::Vector),
            "pgvecto.rs" | "pgvectors" => return Ok(DatabaseExtension::Vectors),
            "vectorchord" => return Ok(DatabaseExtension::VectorChord),
            _ => {}
        }
        DatabaseExtension::ALL
            .into_iter()
            .find(|ext| ext.name() == wanted)
            .ok_or_else(|| WardenError::Config(format!("Unknown database extension: '{}'", s)))
    }
}

/// One row of the vector strategy table
#[derive(Debug)]
pub struct VectorProfile {
    pub extension: DatabaseExtension,
    /// Index access method, as it appears after `USING` in `pg_indexes`
    pub access_method: &'static str,
    /// Operator class for cosine distance
    pub operator_class: &'static str,
    /// Body of the `WITH (options = $$ ... $$)` clause, engine defaults if absent
    pub options: Option<&'static str>,
    /// Schema qualifying the vector column type, if not on the search path
    pub type_schema: Option<&'static str>,
    /// Supported extension versions
    pub version_range: &'static str,
    /// In-engine routine run instead of reindexing on minor/major upgrades
    pub upgrade_routine: Option<&'static str>,
}

impl VectorProfile {
    /// Keyword whose presence in a live index definition marks it current
    pub fn index_keyword(&self) -> String {
        format!("using {}", self.access_method)
    }

    /// Column type for an embedding of the given dimension
    pub fn column_type(&self, dimension: i32) -> String {
        match self.type_schema {
            Some(schema) => format!("{}.vector({})", schema, dimension),
            None => format!("vector({})", dimension),
        }
    }
}

const VECTORCHORD_OPTIONS: &str = "
residual_quantization = false
[build.internal]
lists = [1]
spherical_centroids = true
";

const VECTORS_OPTIONS: &str = "
[indexing.hnsw]
m = 16
ef_construction = 300
";

/// Strategy table, one row per vector extension
pub static VECTOR_PROFILES: [VectorProfile; 3] = [
    VectorProfile {
        extension: DatabaseExtension::VectorChord,
        access_method: "vchordrq",
        operator_class: "vector_cosine_ops",
        options: Some(VECTORCHORD_OPTIONS),
        type_schema: None,
        version_range: ">=0.3, <0.5",
        upgrade_routine: None,
    },
    VectorProfile {
        extension: DatabaseExtension::Vectors,
        access_method: "vectors",
        operator_class: "vector_cos_ops",
        options: Some(VECTORS_OPTIONS),
        type_schema: Some("vectors"),
        version_range: ">=0.2, <0.4",
        upgrade_routine: Some("SELECT pgvectors_upgrade()"),
    },
    VectorProfile {
        extension: DatabaseExtension::Vector,
        access_method: "hnsw",
        operator_class: "vector_cosine_ops",
        options: None,
        type_schema: None,
        version_range: ">=0.5, <1",
        upgrade_routine: None,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_vector_extension_has_one_profile() {
        for ext in DatabaseExtension::VECTOR {
            let rows = VECTOR_PROFILES.iter().filter(|p| p.extension == ext).count();
            assert_eq!(rows, 1, "{} should have exactly one profile", ext);
            assert!(ext.is_vector());
        }
        assert!(!DatabaseExtension::Cube.is_vector());
        assert!(!DatabaseExtension::EarthDistance.is_vector());
    }

    #[test]
    fn test_non_vector_profile_is_config_error() {
        let err = DatabaseExtension::Cube.vector_profile().unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_parse_extension() {
        assert_eq!("vchord".parse::<DatabaseExtension>().unwrap(), DatabaseExtension::VectorChord);
        assert_eq!("pgvector".parse::<DatabaseExtension>().unwrap(), DatabaseExtension::Vector);
        assert_eq!(" Vectors ".parse::<DatabaseExtension>().unwrap(), DatabaseExtension::Vectors);
        assert!("pgvector_x".parse::<DatabaseExtension>().is_err());

        for ext in DatabaseExtension::ALL {
            assert_eq!(ext.to_string().parse::<DatabaseExtension>().unwrap(), ext);
        }
    }

    #[test]
    fn test_column_type() {
        let vectors = DatabaseExtension::Vectors.vector_profile().unwrap();
        assert_eq!(vectors.column_type(512), "vectors.vector(512)");
        let vector = DatabaseExtension::Vector.vector_profile().unwrap();
        assert_eq!(vector.column_type(768), "vector(768)");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DatabaseExtension::VectorChord).unwrap();
        assert_eq!(json, "\"vchord\"");
        let ext: DatabaseExtension = serde_json::from_str("\"vectors\"").unwrap();
        assert_eq!(ext, DatabaseExtension::Vectors);
    }
}
