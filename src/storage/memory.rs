//! In-memory backend
//!
//! Models the parts of a PostgreSQL server the schema manager depends on: the
//! extension and index catalogs, column type modifiers, transactional
//! statement application, the migration history table, and session-scoped
//! advisory locks shared by every clone of the backend. Clones of one
//! `MemoryBackend` behave like separate processes connected to the same
//! database.
//!
//! Statements are recorded in execution order and the DDL the orchestrators
//! issue updates the catalog, so follow-up lookups see the new state.

use crate::error::{Result, WardenError};
use crate::extension::DatabaseExtension;
use crate::storage::{ExtensionVersionInfo, SchemaBackend, Session};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// A statement the backend ran, with the transaction it belonged to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub transaction: Option<u64>,
}

#[derive(Debug, Clone)]
struct LiveIndex {
    table: String,
    definition: String,
}

#[derive(Debug, Clone, Default)]
struct Catalog {
    extensions: HashMap<String, ExtensionVersionInfo>,
    indexes: HashMap<String, LiveIndex>,
    column_modifiers: HashMap<(String, String), i32>,
    migrations: Vec<String>,
}

#[derive(Debug)]
struct ServerState {
    server_version: String,
    catalog: Catalog,
    statements: Vec<ExecutedStatement>,
    /// key -> (session id, reentrancy count)
    advisory: HashMap<i64, (u64, u32)>,
    failures: Vec<String>,
    fail_unlock: bool,
    next_transaction: u64,
}

impl ServerState {
    fn next_transaction(&mut self) -> u64 {
        self.next_transaction += 1;
        self.next_transaction
    }

    /// Record a statement and fail it if it matches an injected failure
    fn check(&mut self, sql: &str, transaction: Option<u64>) -> Result<()> {
        self.statements.push(ExecutedStatement {
            sql: sql.to_string(),
            transaction,
        });
        match self.failures.iter().find(|pattern| sql.contains(pattern.as_str())) {
            Some(pattern) => Err(WardenError::Database(sqlx::Error::Protocol(format!(
                "injected failure on '{}'",
                pattern
            )))),
            None => Ok(()),
        }
    }

    fn release_session(&mut self, session: u64) -> bool {
        let before = self.advisory.len();
        self.advisory.retain(|_, (holder, _)| *holder != session);
        before != self.advisory.len()
    }
}

struct Inner {
    state: Mutex<ServerState>,
    released: Notify,
    next_session: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_acquire(&self, key: i64, session: u64) -> bool {
        let mut state = self.state();
        match state.advisory.get_mut(&key) {
            Some((holder, count)) if *holder == session => {
                *count += 1;
                true
            }
            Some(_) => false,
            None => {
                state.advisory.insert(key, (session, 1));
                true
            }
        }
    }
}

/// In-memory stand-in for a PostgreSQL database
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let state = ServerState {
            server_version: "PostgreSQL 16.4 on x86_64-pc-linux-gnu, compiled by gcc, 64-bit"
                .to_string(),
            catalog: Catalog::default(),
            statements: Vec::new(),
            advisory: HashMap::new(),
            failures: Vec::new(),
            fail_unlock: false,
            next_transaction: 0,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                released: Notify::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn set_server_version(&self, version: &str) {
        self.inner.state().server_version = version.to_string();
    }

    pub fn set_extension(
        &self,
        extension: DatabaseExtension,
        available: Option<&str>,
        installed: Option<&str>,
    ) {
        self.inner.state().catalog.extensions.insert(
            extension.name().to_string(),
            ExtensionVersionInfo {
                available_version: available.map(str::to_string),
                installed_version: installed.map(str::to_string),
            },
        );
    }

    pub fn set_index(&self, index: &str, table: &str, definition: &str) {
        self.inner.state().catalog.indexes.insert(
            index.to_string(),
            LiveIndex {
                table: table.to_string(),
                definition: definition.to_string(),
            },
        );
    }

    pub fn set_column_dimension(&self, table: &str, column: &str, dimension: i32) {
        self.inner
            .state()
            .catalog
            .column_modifiers
            .insert((table.to_string(), column.to_string()), dimension);
    }

    /// Fail every statement containing `pattern`
    #[doc(hidden)]
    pub fn fail_on(&self, pattern: &str) {
        self.inner.state().failures.push(pattern.to_string());
    }

    #[doc(hidden)]
    pub fn clear_failures(&self) {
        self.inner.state().failures.clear();
    }

    /// Make advisory unlock report failure; the lock itself is still released
    #[doc(hidden)]
    pub fn set_fail_unlock(&self, fail: bool) {
        self.inner.state().fail_unlock = fail;
    }

    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.inner.state().statements.clone()
    }

    #[doc(hidden)]
    pub fn clear_statements(&self) {
        self.inner.state().statements.clear();
    }

    pub fn index_definition(&self, index: &str) -> Option<String> {
        self.inner
            .state()
            .catalog
            .indexes
            .get(index)
            .map(|live| live.definition.clone())
    }

    pub fn installed_version(&self, extension: DatabaseExtension) -> Option<String> {
        self.inner
            .state()
            .catalog
            .extensions
            .get(extension.name())
            .and_then(|info| info.installed_version.clone())
    }

    pub fn migration_history(&self) -> Vec<String> {
        self.inner.state().catalog.migrations.clone()
    }

    /// Advisory lock keys currently held by any session
    pub fn held_advisory_locks(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.inner.state().advisory.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    fn open_session(&self) -> MemorySession {
        MemorySession {
            id: self.inner.next_session.fetch_add(1, Ordering::SeqCst),
            inner: Arc::clone(&self.inner),
            held: Vec::new(),
            transaction: None,
        }
    }
}

/// Apply the catalog effects of the DDL the orchestrators issue
fn apply_effects(catalog: &mut Catalog, sql: &str) {
    let words: Vec<&str> = sql
        .split_whitespace()
        .map(|word| word.trim_end_matches(';'))
        .collect();

    match words.as_slice() {
        ["DROP", "INDEX", "IF", "EXISTS", name, ..] | ["DROP", "INDEX", name, ..] => {
            catalog.indexes.remove(*name);
        }
        ["CREATE", "INDEX", "IF", "NOT", "EXISTS", name, "ON", table, ..]
        | ["CREATE", "INDEX", name, "ON", table, ..] => {
            catalog
                .indexes
                .entry(name.to_string())
                .or_insert_with(|| LiveIndex {
                    table: table.to_string(),
                    definition: sql.trim().to_string(),
                });
        }
        ["ALTER", "EXTENSION", name, "UPDATE", "TO", version, ..] => {
            let info = catalog.extensions.entry(name.to_string()).or_default();
            info.installed_version = Some(version.trim_matches('\'').to_string());
        }
        ["CREATE", "EXTENSION", "IF", "NOT", "EXISTS", name, ..] | ["CREATE", "EXTENSION", name, ..] => {
            let info = catalog.extensions.entry(name.to_string()).or_default();
            if info.installed_version.is_none() {
                info.installed_version = info.available_version.clone();
            }
        }
        ["ALTER", "TABLE", table, "ALTER", "COLUMN", column, "SET", "DATA", "TYPE", column_type, ..] => {
            let modifier = column_type
                .split_once('(')
                .and_then(|(_, rest)| rest.trim_end_matches(')').parse::<i32>().ok())
                .unwrap_or(-1);
            catalog
                .column_modifiers
                .insert((table.to_string(), column.to_string()), modifier);
        }
        _ => {}
    }
}

#[async_trait]
impl SchemaBackend for MemoryBackend {
    async fn extension_version(&self, name: &str) -> Result<ExtensionVersionInfo> {
        Ok(self
            .inner
            .state()
            .catalog
            .extensions
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.inner.state().server_version.clone())
    }

    async fn index_definitions(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let state = self.inner.state();
        Ok(names
            .iter()
            .filter_map(|name| {
                state
                    .catalog
                    .indexes
                    .get(*name)
                    .map(|live| (name.to_string(), live.definition.clone()))
            })
            .collect())
    }

    async fn index_table(&self, index: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .state()
            .catalog
            .indexes
            .get(index)
            .map(|live| live.table.clone()))
    }

    async fn column_type_modifier(&self, table: &str, column: &str) -> Result<Option<i32>> {
        Ok(self
            .inner
            .state()
            .catalog
            .column_modifiers
            .get(&(table.to_string(), column.to_string()))
            .copied())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut state = self.inner.state();
        state.check(sql, None)?;
        apply_effects(&mut state.catalog, sql);
        Ok(())
    }

    async fn transaction(&self, statements: &[String]) -> Result<()> {
        let mut state = self.inner.state();
        let transaction = state.next_transaction();
        let mut staged = state.catalog.clone();
        for statement in statements {
            state.check(statement, Some(transaction))?;
            apply_effects(&mut staged, statement);
        }
        state.catalog = staged;
        Ok(())
    }

    async fn dedicated(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(self.open_session()))
    }

    async fn schema_session(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(self.open_session()))
    }
}

/// One connection to a [`MemoryBackend`]
///
/// Dropping the session ends it and releases every advisory lock it holds.
pub struct MemorySession {
    id: u64,
    inner: Arc<Inner>,
    held: Vec<i64>,
    transaction: Option<(u64, Catalog)>,
}

impl MemorySession {
    fn in_transaction(&self) -> Result<u64> {
        self.transaction
            .as_ref()
            .map(|(id, _)| *id)
            .ok_or_else(|| WardenError::Database(sqlx::Error::Protocol("no transaction in progress".to_string())))
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn advisory_lock(&mut self, key: i64) -> Result<()> {
        loop {
            let released = self.inner.released.notified();
            if self.inner.try_acquire(key, self.id) {
                self.held.push(key);
                return Ok(());
            }
            released.await;
        }
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool> {
        let acquired = self.inner.try_acquire(key, self.id);
        if acquired {
            self.held.push(key);
        }
        Ok(acquired)
    }

    async fn advisory_unlock(&mut self, key: i64) -> Result<()> {
        let fail_unlock = {
            let mut state = self.inner.state();
            let released = match state.advisory.get_mut(&key) {
                Some((holder, count)) if *holder == self.id => {
                    *count -= 1;
                    if *count == 0 {
                        state.advisory.remove(&key);
                    }
                    true
                }
                _ => false,
            };
            if !released {
                return Err(WardenError::Lock(format!(
                    "Advisory lock {} was not held by session {}",
                    key, self.id
                )));
            }
            state.fail_unlock
        };

        if let Some(position) = self.held.iter().position(|held| *held == key) {
            self.held.remove(position);
        }
        self.inner.released.notify_waiters();

        if fail_unlock {
            return Err(WardenError::Database(sqlx::Error::Protocol(
                "injected failure on advisory unlock".to_string(),
            )));
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut state = self.inner.state();
        match self.transaction.as_mut() {
            Some((id, staged)) => {
                state.check(sql, Some(*id))?;
                apply_effects(staged, sql);
            }
            None => {
                state.check(sql, None)?;
                apply_effects(&mut state.catalog, sql);
            }
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(WardenError::Database(sqlx::Error::Protocol(
                "transaction already in progress".to_string(),
            )));
        }
        let mut state = self.inner.state();
        let id = state.next_transaction();
        self.transaction = Some((id, state.catalog.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.in_transaction()?;
        if let Some((_, staged)) = self.transaction.take() {
            self.inner.state().catalog = staged;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction()?;
        self.transaction = None;
        Ok(())
    }

    async fn ensure_migration_table(&mut self) -> Result<()> {
        Ok(())
    }

    async fn applied_migrations(&mut self) -> Result<Vec<String>> {
        Ok(match self.transaction.as_ref() {
            Some((_, staged)) => staged.migrations.clone(),
            None => self.inner.state().catalog.migrations.clone(),
        })
    }

    async fn record_migration(&mut self, name: &str) -> Result<()> {
        match self.transaction.as_mut() {
            Some((_, staged)) => staged.migrations.push(name.to_string()),
            None => self.inner.state().catalog.migrations.push(name.to_string()),
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if self.inner.state().release_session(self.id) {
            self.inner.released.notify_waiters();
        }
    }
}
