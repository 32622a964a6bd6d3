//! Database access for schema-warden
//!
//! The orchestrators talk to the database through two seams:
//!
//! - [`SchemaBackend`]: the shared, pooled side. Catalog lookups, autocommit
//!   statements and statement-batch transactions.
//! - [`Session`]: one connection reserved for a single caller. Advisory locks
//!   are session-scoped, so they are only ever taken on a `Session`, and the
//!   migration runner applies scripts over one as well.
//!
//! [`PgBackend`] implements both over `sqlx`; [`MemoryBackend`] is an
//! in-process stand-in used by the test suites.

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;

// Re-export main types
pub use database::PgBackend;
pub use memory::{ExecutedStatement, MemoryBackend};
pub use migrations::{Migration, MigrationMode, MigrationRunner, MigrationSource};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Catalog view of one extension
///
/// Both fields unset means the engine does not know the extension. An
/// available version without an installed one means it can be installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionVersionInfo {
    pub available_version: Option<String>,
    pub installed_version: Option<String>,
}

impl ExtensionVersionInfo {
    pub fn is_installed(&self) -> bool {
        self.installed_version.is_some()
    }

    pub fn is_known(&self) -> bool {
        self.available_version.is_some() || self.installed_version.is_some()
    }
}

/// Pooled database access
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// Default and installed version of an extension, by catalog name
    async fn extension_version(&self, name: &str) -> Result<ExtensionVersionInfo>;

    /// Full `SELECT version()` text of the server
    async fn server_version(&self) -> Result<String>;

    /// Live `CREATE INDEX` text for each of the named indexes that exists
    async fn index_definitions(&self, names: &[&str]) -> Result<HashMap<String, String>>;

    /// Table owning an index, if the index exists
    async fn index_table(&self, index: &str) -> Result<Option<String>>;

    /// Type modifier of a column, which is the dimension for vector columns
    async fn column_type_modifier(&self, table: &str, column: &str) -> Result<Option<i32>>;

    /// Run one statement outside any explicit transaction
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Run statements in order inside a single transaction
    async fn transaction(&self, statements: &[String]) -> Result<()>;

    /// Reserve a pooled connection until the session is closed
    async fn dedicated(&self) -> Result<Box<dyn Session>>;

    /// Open a connection outside the pool, for schema management
    async fn schema_session(&self) -> Result<Box<dyn Session>>;
}

/// A single reserved connection
#[async_trait]
pub trait Session: Send {
    /// Block until the session-scoped advisory lock is held
    async fn advisory_lock(&mut self, key: i64) -> Result<()>;

    /// Take the advisory lock if free, without waiting
    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool>;

    /// Release an advisory lock held by this session
    async fn advisory_unlock(&mut self, key: i64) -> Result<()>;

    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Create the migration history table if missing
    async fn ensure_migration_table(&mut self) -> Result<()>;

    /// Names of applied migrations, in application order
    async fn applied_migrations(&mut self) -> Result<Vec<String>>;

    async fn record_migration(&mut self, name: &str) -> Result<()>;

    /// Give the connection back (pooled) or close it (unpooled)
    async fn close(self: Box<Self>) -> Result<()>;
}
