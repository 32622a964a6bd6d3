//! Vector index rebuilds
//!
//! A rebuild retypes the embedding column through `real[]` so that data can
//! move between vector types that have no direct cast, then recreates the
//! index for the active extension. The old index is dropped before the
//! rebuild transaction starts: if the transaction fails, the table is left
//! without its vector index until the next rebuild.

use crate::error::{Result, WardenError};
use crate::extension::{DatabaseExtension, create_index_statement, needs_reindex};
use crate::index::VectorIndex;
use crate::lock::LockCoordinator;
use crate::storage::SchemaBackend;
use crate::utils::{is_valid_dimension, validate_identifier};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ReindexOrchestrator {
    backend: Arc<dyn SchemaBackend>,
    locks: Arc<LockCoordinator>,
    extension: DatabaseExtension,
}

impl ReindexOrchestrator {
    /// Create an orchestrator for the active vector extension
    pub fn new(
        backend: Arc<dyn SchemaBackend>,
        locks: Arc<LockCoordinator>,
        extension: DatabaseExtension,
    ) -> Result<Self> {
        extension.vector_profile()?;
        Ok(Self {
            backend,
            locks,
            extension,
        })
    }

    pub fn extension(&self) -> DatabaseExtension {
        self.extension
    }

    /// Rebuild one index under its lock
    ///
    /// Returns `false` without touching the schema when the index's table
    /// cannot be found; the index may not have been created yet.
    pub async fn reindex(&self, index: VectorIndex) -> Result<bool> {
        self.locks
            .with_lock(index.lock(), || self.rebuild(index))
            .await
    }

    async fn rebuild(&self, index: VectorIndex) -> Result<bool> {
        let Some(table) = self.backend.index_table(index.name()).await? else {
            log::warn!("Could not find table for index {}, skipping reindex", index);
            return Ok(false);
        };
        let table = validate_identifier(&table)?;
        let column = index.column();

        let modifier = self.backend.column_type_modifier(table, column).await?;
        let dimension = match modifier {
            Some(dimension) if is_valid_dimension(dimension) => dimension,
            other => {
                return Err(WardenError::Precondition(format!(
                    "Could not determine dimension size of {}.{} (type modifier {:?})",
                    table, column, other
                )));
            }
        };

        let profile = self.extension.vector_profile()?;
        let statements = vec![
            format!("ALTER TABLE {} ALTER COLUMN {} SET DATA TYPE real[]", table, column),
            format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DATA TYPE {}",
                table,
                column,
                profile.column_type(dimension)
            ),
            create_index_statement(self.extension, table, index.name())?,
        ];

        log::info!(
            "Reindexing {} on {} ({} dimensions) for {}",
            index,
            table,
            dimension,
            self.extension.display_name()
        );

        self.backend
            .execute(&format!("DROP INDEX IF EXISTS {}", index.name()))
            .await?;
        self.backend.transaction(&statements).await?;

        log::info!("Reindexed {}", index);
        Ok(true)
    }

    /// Which of `indexes` have drifted from the active extension
    pub async fn should_reindex(&self, indexes: &[VectorIndex]) -> Result<BTreeMap<VectorIndex, bool>> {
        let names: Vec<&str> = indexes.iter().map(|index| index.name()).collect();
        let live = self.backend.index_definitions(&names).await?;
        let decisions = needs_reindex(self.extension, &names, &live)?;

        Ok(indexes
            .iter()
            .map(|index| (*index, decisions.get(index.name()).copied().unwrap_or(true)))
            .collect())
    }

    /// Rebuild every known index that has drifted, returning the rebuilt ones
    pub async fn reindex_if_needed(&self) -> Result<Vec<VectorIndex>> {
        let drifted: Vec<VectorIndex> = self
            .should_reindex(&VectorIndex::ALL)
            .await?
            .into_iter()
            .filter_map(|(index, stale)| stale.then_some(index))
            .collect();

        if drifted.is_empty() {
            log::debug!("Vector indexes match {}", self.extension.display_name());
            return Ok(Vec::new());
        }

        let rebuilt = try_join_all(drifted.iter().map(|index| self.reindex(*index))).await?;
        Ok(drifted
            .into_iter()
            .zip(rebuilt)
            .filter_map(|(index, done)| done.then_some(index))
            .collect())
    }
}
