//! # schema-warden
//!
//! Schema evolution and vector-index lifecycle management for PostgreSQL
//! databases shared by several server processes.
//!
//! Migrations, extension upgrades and index rebuilds each run under a named
//! lock that is held both in-process and as a PostgreSQL advisory lock, so
//! only one process mutates a given part of the schema at a time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use schema_warden::{Config, SchemaManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Defaults with DB_* environment overrides
//!     let config = Config::from_env()?;
//!
//!     // Connect and detect the active vector extension
//!     let manager = SchemaManager::connect(config).await?;
//!
//!     // Install or upgrade the extension, migrate, rebuild drifted indexes
//!     let report = manager.bootstrap().await?;
//!     println!("Applied {} migrations", report.migrations_applied.len());
//!
//!     if report.restart_required {
//!         println!("Restart the database to finish the extension upgrade");
//!     }
//!
//!     Ok(())
//! }
//! ```

// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod extension;
pub mod index;
pub mod lock;
pub mod storage;
pub mod utils;

// Re-export main API types
pub use api::{BootstrapReport, SchemaManager};
pub use config::Config;
pub use error::{Result, WardenError};

// Re-export commonly used types
pub use extension::{
    DatabaseExtension, ExtensionUpgradeOrchestrator, VectorUpgradeResult, VersionDiff,
    VersionResolver,
};
pub use index::{ReindexOrchestrator, VectorIndex};
pub use lock::{LockCoordinator, NamedLock};
pub use storage::{MemoryBackend, MigrationMode, MigrationRunner, PgBackend, SchemaBackend};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_imports() {
        // Ensure all major types can be imported
        let _config = Config::default();
        assert_eq!(NamedLock::ALL.len(), NamedLock::COUNT);
    }
}
