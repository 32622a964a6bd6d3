//! SQL text used against the PostgreSQL catalogs

/// SQL for creating the migration history table
pub const CREATE_MIGRATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    name TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const SELECT_APPLIED_MIGRATIONS: &str =
    "SELECT name FROM schema_migrations ORDER BY applied_at, name";

pub const INSERT_MIGRATION: &str = "INSERT INTO schema_migrations (name) VALUES ($1)";

/// Default and installed version of an extension
pub const SELECT_EXTENSION_VERSION: &str = r#"
SELECT default_version, installed_version
FROM pg_available_extensions
WHERE name = $1
"#;

pub const SELECT_SERVER_VERSION: &str = "SELECT version()";

/// Live definitions of a set of indexes
pub const SELECT_INDEX_DEFINITIONS: &str = r#"
SELECT indexname::text, indexdef
FROM pg_indexes
WHERE indexname::text = ANY($1)
"#;

/// Table owning an index
pub const SELECT_INDEX_TABLE: &str = r#"
SELECT relname::text
FROM pg_stat_all_indexes
WHERE indexrelname::text = $1
"#;

/// Type modifier of a column on an ordinary table
pub const SELECT_COLUMN_TYPE_MODIFIER: &str = r#"
SELECT f.atttypmod
FROM pg_attribute f
JOIN pg_class c ON c.oid = f.attrelid
WHERE c.relkind = 'r'::char
  AND f.attnum > 0
  AND c.relname::text = $1
  AND f.attname::text = $2
"#;

pub const ADVISORY_LOCK: &str = "SELECT pg_advisory_lock($1)";

pub const TRY_ADVISORY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";

pub const ADVISORY_UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

/// Search path that resolves every vector extension's objects
pub const SET_VECTOR_SEARCH_PATH: &str = r#"SET search_path TO "$user", public, vectors"#;
