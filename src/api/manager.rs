//! SchemaManager - Main schema management API
//!
//! Wires the lock coordinator, version resolver, upgrade and reindex
//! orchestrators and the migration runner from one [`Config`].

use crate::config::Config;
use crate::error::{Result, WardenError};
use crate::extension::{DatabaseExtension, ExtensionUpgradeOrchestrator, VectorUpgradeResult, VersionResolver};
use crate::index::{ReindexOrchestrator, VectorIndex};
use crate::lock::{LockCoordinator, NamedLock};
use crate::storage::{ExtensionVersionInfo, MigrationRunner, MigrationSource, PgBackend, SchemaBackend};
use crate::utils::{coerce_version, satisfies};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a bootstrap run did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub postgres_version: String,
    pub extension: DatabaseExtension,
    /// Installed version of the active extension after the run
    pub extension_version: Option<String>,
    pub extension_created: bool,
    pub extension_upgraded: bool,
    pub restart_required: bool,
    pub migrations_applied: Vec<String>,
    pub reindexed: Vec<VectorIndex>,
}

/// Main entry point for schema management
pub struct SchemaManager {
    config: Config,
    backend: Arc<dyn SchemaBackend>,
    locks: Arc<LockCoordinator>,
    versions: VersionResolver,
    reindexer: Arc<ReindexOrchestrator>,
    upgrader: ExtensionUpgradeOrchestrator,
    migrations: MigrationRunner,
}

impl SchemaManager {
    /// Connect to PostgreSQL and load migrations from the configured directory
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let source = load_migrations(&config)?;
        let backend = PgBackend::connect(&config.database).await?;
        Self::new(config, Arc::new(backend), source).await
    }

    /// Build a manager over an existing backend
    ///
    /// The active vector extension is taken from the configuration, or
    /// detected from the catalog when unset.
    pub async fn new(
        config: Config,
        backend: Arc<dyn SchemaBackend>,
        source: MigrationSource,
    ) -> Result<Self> {
        config.validate()?;

        let versions = VersionResolver::new(Arc::clone(&backend));
        let extension = versions
            .detect_vector_extension(config.database.vector_extension)
            .await?;
        log::info!("Using vector extension {}", extension.display_name());

        let locks = Arc::new(LockCoordinator::new(Arc::clone(&backend)));
        let reindexer = Arc::new(ReindexOrchestrator::new(
            Arc::clone(&backend),
            Arc::clone(&locks),
            extension,
        )?);
        let upgrader = ExtensionUpgradeOrchestrator::new(
            Arc::clone(&backend),
            Arc::clone(&locks),
            Arc::clone(&reindexer),
        );
        let migrations = MigrationRunner::new(Arc::clone(&backend), source);

        Ok(Self {
            config,
            backend,
            locks,
            versions,
            reindexer,
            upgrader,
            migrations,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The active vector extension
    pub fn extension(&self) -> DatabaseExtension {
        self.reindexer.extension()
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn versions(&self) -> &VersionResolver {
        &self.versions
    }

    pub fn backend(&self) -> &Arc<dyn SchemaBackend> {
        &self.backend
    }

    /// Apply pending migrations under the migrations lock
    pub async fn run_migrations(&self) -> Result<Vec<String>> {
        self.locks
            .with_lock(NamedLock::Migrations, || {
                self.migrations.run_migrations(self.config.migrations.mode)
            })
            .await
    }

    pub async fn pending_migrations(&self) -> Result<Vec<String>> {
        self.migrations.pending_migrations().await
    }

    /// Update the active extension
    pub async fn update_extension(&self, target_version: Option<&str>) -> Result<VectorUpgradeResult> {
        self.upgrader
            .update_extension(self.extension(), target_version)
            .await
    }

    pub async fn reindex(&self, index: VectorIndex) -> Result<bool> {
        self.reindexer.reindex(index).await
    }

    pub async fn reindex_if_needed(&self) -> Result<Vec<VectorIndex>> {
        self.reindexer.reindex_if_needed().await
    }

    /// Which known indexes no longer match the active extension
    pub async fn check_drift(&self) -> Result<BTreeMap<VectorIndex, bool>> {
        self.reindexer.should_reindex(&VectorIndex::ALL).await
    }

    /// Catalog versions of every extension schema-warden knows
    pub async fn extension_versions(&self) -> Result<Vec<(DatabaseExtension, ExtensionVersionInfo)>> {
        let mut versions = Vec::with_capacity(DatabaseExtension::ALL.len());
        for extension in DatabaseExtension::ALL {
            versions.push((extension, self.versions.get_extension_version(extension).await?));
        }
        Ok(versions)
    }

    /// Bring the database up to date
    ///
    /// Runs under the migrations lock: checks the server version, installs or
    /// upgrades the active extension, applies pending migrations, then
    /// rebuilds any vector index that drifted from the active extension.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        self.locks
            .with_lock(NamedLock::Migrations, || self.bootstrap_locked())
            .await
    }

    async fn bootstrap_locked(&self) -> Result<BootstrapReport> {
        let postgres = self.versions.check_postgres_version().await?;
        let mut report = BootstrapReport {
            postgres_version: postgres.to_string(),
            extension: self.extension(),
            extension_version: None,
            extension_created: false,
            extension_upgraded: false,
            restart_required: false,
            migrations_applied: Vec::new(),
            reindexed: Vec::new(),
        };

        self.prepare_extension(&mut report).await?;

        report.migrations_applied = self
            .migrations
            .run_migrations(self.config.migrations.mode)
            .await?;

        if report.restart_required {
            log::warn!("Skipping vector index checks until the database has been restarted");
        } else {
            report.reindexed = self.reindexer.reindex_if_needed().await?;
        }

        log::info!(
            "Bootstrap complete: {} migrations applied, {} indexes rebuilt",
            report.migrations_applied.len(),
            report.reindexed.len()
        );
        Ok(report)
    }

    async fn prepare_extension(&self, report: &mut BootstrapReport) -> Result<()> {
        let extension = self.extension();
        let range = VersionResolver::get_extension_version_range(extension)?;
        let info = self.versions.get_extension_version(extension).await?;

        match (info.installed_version, info.available_version) {
            (None, None) => {
                return Err(WardenError::Precondition(format!(
                    "The {} extension is not available on this server",
                    extension.display_name()
                )));
            }
            (None, Some(available)) => {
                if !satisfies(&available, &range)? {
                    return Err(WardenError::Precondition(format!(
                        "{} {} is available, but the supported range is {}",
                        extension.display_name(),
                        available,
                        range
                    )));
                }
                self.upgrader.create_extension(extension).await?;
                report.extension_created = true;
            }
            (Some(installed), Some(available)) => {
                let newer = coerce_version(&available)? > coerce_version(&installed)?;
                if newer && satisfies(&available, &range)? {
                    let result = self
                        .upgrader
                        .update_extension(extension, Some(&available))
                        .await?;
                    report.extension_upgraded = true;
                    report.restart_required = result.restart_required;
                }
            }
            (Some(_), None) => {}
        }

        let installed = self
            .versions
            .get_extension_version(extension)
            .await?
            .installed_version
            .ok_or_else(|| {
                WardenError::Precondition(format!(
                    "The {} extension is not installed",
                    extension.display_name()
                ))
            })?;
        if !satisfies(&installed, &range)? {
            return Err(WardenError::Precondition(format!(
                "{} {} is installed, but the supported range is {}",
                extension.display_name(),
                installed,
                range
            )));
        }

        report.extension_version = Some(installed);
        Ok(())
    }
}

/// Migrations from the configured directory; none when it does not exist
pub fn load_migrations(config: &Config) -> Result<MigrationSource> {
    let directory = &config.migrations.directory;
    if directory.is_dir() {
        MigrationSource::from_directory(directory)
    } else {
        log::warn!(
            "Migration directory {} not found, no migrations will run",
            directory.display()
        );
        Ok(MigrationSource::default())
    }
}
