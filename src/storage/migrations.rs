//! Database migrations
//!
//! Migration scripts are authored outside this crate. The runner applies the
//! ones missing from the `schema_migrations` history table, in name order, on
//! a schema-management connection that is separate from the shared pool.

use crate::error::{Result, WardenError};
use crate::storage::{SchemaBackend, Session};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Transaction granularity for a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    /// One transaction around every pending migration
    All,
    /// No explicit transaction
    None,
    /// One transaction per migration
    Each,
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationMode::All => "all",
            MigrationMode::None => "none",
            MigrationMode::Each => "each",
        })
    }
}

impl FromStr for MigrationMode {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(MigrationMode::All),
            "none" => Ok(MigrationMode::None),
            "each" => Ok(MigrationMode::Each),
            other => Err(WardenError::Config(format!(
                "Unknown migration mode '{}', expected all, none or each",
                other
            ))),
        }
    }
}

/// A single migration script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Ordered set of migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationSource {
    migrations: Vec<Migration>,
}

impl MigrationSource {
    /// Sort migrations by name, rejecting duplicates
    pub fn new(mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = migrations.windows(2).find(|pair| pair[0].name == pair[1].name) {
            return Err(WardenError::Config(format!(
                "Duplicate migration name: {}",
                pair[0].name
            )));
        }
        Ok(Self { migrations })
    }

    /// Load every `*.sql` file of a directory; the file stem is the name
    pub fn from_directory<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref();
        let mut migrations = Vec::new();

        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| {
                    WardenError::Config(format!("Invalid migration file name: {}", path.display()))
                })?
                .to_string();
            let sql = std::fs::read_to_string(&path)?;
            migrations.push(Migration { name, sql });
        }

        log::info!(
            "Loaded {} migrations from {}",
            migrations.len(),
            directory.display()
        );
        Self::new(migrations)
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

/// Applies pending migrations
///
/// Callers are expected to hold the migrations lock while running it.
pub struct MigrationRunner {
    backend: Arc<dyn SchemaBackend>,
    source: MigrationSource,
}

impl MigrationRunner {
    pub fn new(backend: Arc<dyn SchemaBackend>, source: MigrationSource) -> Self {
        Self { backend, source }
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    /// Apply all pending migrations, returning the names applied
    ///
    /// The schema connection is closed whether or not the run succeeds.
    pub async fn run_migrations(&self, mode: MigrationMode) -> Result<Vec<String>> {
        log::info!("Running migrations (transaction mode: {})", mode);

        let mut session = self.backend.schema_session().await?;
        let outcome = self.apply_pending(session.as_mut(), mode).await;
        let closed = session.close().await;

        let applied = match (outcome, closed) {
            (Ok(applied), Ok(())) => applied,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Err(close_err)) => {
                log::error!("Failed to close schema connection: {}", close_err);
                return Err(e);
            }
            (Err(e), Ok(())) => return Err(e),
        };

        log::info!("Applied {} migrations", applied.len());
        Ok(applied)
    }

    /// Names of migrations that have not been applied yet
    pub async fn pending_migrations(&self) -> Result<Vec<String>> {
        let mut session = self.backend.schema_session().await?;
        let pending = self.pending(session.as_mut()).await;
        session.close().await?;
        Ok(pending?.into_iter().map(|m| m.name.clone()).collect())
    }

    async fn pending(&self, session: &mut dyn Session) -> Result<Vec<&Migration>> {
        session.ensure_migration_table().await?;
        let applied = session.applied_migrations().await?;

        for name in &applied {
            if !self.source.migrations.iter().any(|m| &m.name == name) {
                log::warn!("Applied migration '{}' is missing from the migration source", name);
            }
        }

        Ok(self
            .source
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.name))
            .collect())
    }

    async fn apply_pending(&self, session: &mut dyn Session, mode: MigrationMode) -> Result<Vec<String>> {
        let pending = self.pending(session).await?;
        if pending.is_empty() {
            log::info!("Database schema is up to date");
            return Ok(Vec::new());
        }

        match mode {
            MigrationMode::All => {
                session.begin().await?;
                for migration in &pending {
                    if let Err(e) = apply_migration(session, migration).await {
                        return Err(rollback_after(session, e).await);
                    }
                }
                session.commit().await?;
            }
            MigrationMode::Each => {
                for migration in &pending {
                    session.begin().await?;
                    if let Err(e) = apply_migration(session, migration).await {
                        return Err(rollback_after(session, e).await);
                    }
                    session.commit().await?;
                }
            }
            MigrationMode::None => {
                for migration in &pending {
                    apply_migration(session, migration).await?;
                }
            }
        }

        Ok(pending.into_iter().map(|m| m.name.clone()).collect())
    }
}

async fn apply_migration(session: &mut dyn Session, migration: &Migration) -> Result<()> {
    log::info!("Applying migration: {}", migration.name);
    session
        .execute(&migration.sql)
        .await
        .map_err(|e| WardenError::Migration {
            name: migration.name.clone(),
            message: e.to_string(),
        })?;
    session.record_migration(&migration.name).await
}

async fn rollback_after(session: &mut dyn Session, error: WardenError) -> WardenError {
    if let Err(rollback_err) = session.rollback().await {
        log::error!("Rollback after failed migration also failed: {}", rollback_err);
    }
    error
}
