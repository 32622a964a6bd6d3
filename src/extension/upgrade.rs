//! Vector extension upgrades
//!
//! `ALTER EXTENSION ... UPDATE` runs in one transaction. Extensions with a
//! dedicated upgrade routine (pgvecto.rs) run it in the same transaction on
//! minor and major steps and need a server restart afterwards. Every other
//! update, including one to the installed version, is followed by a rebuild
//! of the known vector indexes.

use super::version::{VersionDiff, VersionResolver, version_diff};
use super::DatabaseExtension;
use crate::error::{Result, WardenError};
use crate::index::{ReindexOrchestrator, VectorIndex};
use crate::lock::{LockCoordinator, NamedLock};
use crate::storage::SchemaBackend;
use crate::storage::schema::SET_VECTOR_SEARCH_PATH;
use crate::utils::coerce_version;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of an extension upgrade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorUpgradeResult {
    /// The server must be restarted before the extension is usable
    pub restart_required: bool,
}

pub struct ExtensionUpgradeOrchestrator {
    backend: Arc<dyn SchemaBackend>,
    locks: Arc<LockCoordinator>,
    versions: VersionResolver,
    reindexer: Arc<ReindexOrchestrator>,
}

impl ExtensionUpgradeOrchestrator {
    pub fn new(
        backend: Arc<dyn SchemaBackend>,
        locks: Arc<LockCoordinator>,
        reindexer: Arc<ReindexOrchestrator>,
    ) -> Self {
        Self {
            versions: VersionResolver::new(Arc::clone(&backend)),
            backend,
            locks,
            reindexer,
        }
    }

    /// Install an extension if it is not installed yet
    pub async fn create_extension(&self, extension: DatabaseExtension) -> Result<()> {
        log::info!("Creating extension {}", extension.display_name());
        self.backend
            .execute(&format!(
                "CREATE EXTENSION IF NOT EXISTS {} CASCADE",
                extension.name()
            ))
            .await
    }

    /// Update a vector extension to `target_version`, or to the newest
    /// available version when none is given
    pub async fn update_extension(
        &self,
        extension: DatabaseExtension,
        target_version: Option<&str>,
    ) -> Result<VectorUpgradeResult> {
        self.locks
            .with_lock(NamedLock::ExtensionUpgrade, || {
                self.update_locked(extension, target_version)
            })
            .await
    }

    async fn update_locked(
        &self,
        extension: DatabaseExtension,
        target_version: Option<&str>,
    ) -> Result<VectorUpgradeResult> {
        let profile = extension.vector_profile()?;
        let info = self.versions.get_extension_version(extension).await?;

        let installed = info.installed_version.ok_or_else(|| {
            WardenError::Precondition(format!(
                "{} extension is not installed",
                extension.display_name()
            ))
        })?;
        let available = info.available_version.ok_or_else(|| {
            WardenError::Precondition(format!(
                "No available version for {} extension",
                extension.display_name()
            ))
        })?;
        let target = target_version.map(str::to_string).unwrap_or(available);

        // The version is spliced into the statement as a literal
        if target.contains('\'') {
            return Err(WardenError::Config(format!("Invalid target version: {}", target)));
        }
        coerce_version(&target)?;

        let diff = version_diff(&installed, &target)?;
        let upgrade_routine = profile
            .upgrade_routine
            .filter(|_| matches!(diff, VersionDiff::Minor | VersionDiff::Major));

        let mut statements = vec![
            SET_VECTOR_SEARCH_PATH.to_string(),
            format!("ALTER EXTENSION {} UPDATE TO '{}'", extension.name(), target),
        ];
        if let Some(routine) = upgrade_routine {
            statements.push(routine.to_string());
        }

        log::info!(
            "Updating {} from {} to {} ({:?} change)",
            extension.display_name(),
            installed,
            target,
            diff
        );
        self.backend.transaction(&statements).await?;

        if upgrade_routine.is_some() {
            log::warn!(
                "{} was upgraded with its upgrade routine; a database restart is required",
                extension.display_name()
            );
            return Ok(VectorUpgradeResult {
                restart_required: true,
            });
        }

        try_join_all(
            VectorIndex::ALL
                .iter()
                .map(|index| self.reindexer.reindex(*index)),
        )
        .await?;

        Ok(VectorUpgradeResult::default())
    }
}
