//! PostgreSQL backend over sqlx
//!
//! Pooled work goes through a `PgPool`. Advisory locks are taken on a
//! `PoolConnection` held for the whole critical section, and migrations run on
//! a fresh `PgConnection` that never enters the pool.

use crate::config::DatabaseConfig;
use crate::error::{Result, WardenError};
use crate::storage::schema::*;
use crate::storage::{ExtensionVersionInfo, SchemaBackend, Session};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, Postgres};
use sqlx::{Connection, Executor};
use std::collections::HashMap;

/// Pooled PostgreSQL access
pub struct PgBackend {
    pool: PgPool,
    options: PgConnectOptions,
}

impl PgBackend {
    /// Connect the shared pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options: PgConnectOptions = config
            .url
            .parse()
            .map_err(|e| WardenError::Config(format!("Invalid database URL: {}", e)))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options.clone())
            .await?;

        log::info!(
            "Connected to PostgreSQL with a pool of up to {} connections",
            config.max_connections
        );
        Ok(Self { pool, options })
    }
}

#[async_trait]
impl SchemaBackend for PgBackend {
    async fn extension_version(&self, name: &str) -> Result<ExtensionVersionInfo> {
        let row: Option<(Option<String>, Option<String>)> =
            sqlx::query_as(SELECT_EXTENSION_VERSION)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match row {
            Some((available_version, installed_version)) => ExtensionVersionInfo {
                available_version,
                installed_version,
            },
            None => ExtensionVersionInfo::default(),
        })
    }

    async fn server_version(&self) -> Result<String> {
        let version: String = sqlx::query_scalar(SELECT_SERVER_VERSION)
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    async fn index_definitions(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let rows: Vec<(String, String)> = sqlx::query_as(SELECT_INDEX_DEFINITIONS)
            .bind(names)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn index_table(&self, index: &str) -> Result<Option<String>> {
        let table: Option<String> = sqlx::query_scalar(SELECT_INDEX_TABLE)
            .bind(index)
            .fetch_optional(&self.pool)
            .await?;
        Ok(table)
    }

    async fn column_type_modifier(&self, table: &str, column: &str) -> Result<Option<i32>> {
        let modifier: Option<i32> = sqlx::query_scalar(SELECT_COLUMN_TYPE_MODIFIER)
            .bind(table)
            .bind(column)
            .fetch_optional(&self.pool)
            .await?;
        Ok(modifier)
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        log::debug!("Executing: {}", sql);
        self.pool.execute(sql).await?;
        Ok(())
    }

    async fn transaction(&self, statements: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            log::debug!("Executing in transaction: {}", statement);
            // Dropping `tx` on error rolls the transaction back
            (&mut *tx).execute(statement.as_str()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn dedicated(&self) -> Result<Box<dyn Session>> {
        let connection = self.pool.acquire().await?;
        Ok(Box::new(PgSession::new(SessionConnection::Pooled(connection))))
    }

    async fn schema_session(&self) -> Result<Box<dyn Session>> {
        let connection = PgConnection::connect_with(&self.options).await?;
        Ok(Box::new(PgSession::new(SessionConnection::Owned(connection))))
    }
}

enum SessionConnection {
    Pooled(PoolConnection<Postgres>),
    Owned(PgConnection),
}

/// One reserved PostgreSQL connection
///
/// Advisory locks still held when the session ends mean the pooled
/// connection cannot go back to the pool: it is detached and closed instead,
/// which ends the server session and frees its locks.
pub struct PgSession {
    connection: Option<SessionConnection>,
    held: Vec<i64>,
}

impl PgSession {
    fn new(connection: SessionConnection) -> Self {
        Self {
            connection: Some(connection),
            held: Vec::new(),
        }
    }

    fn conn(&mut self) -> Result<&mut PgConnection> {
        match self.connection.as_mut() {
            Some(SessionConnection::Pooled(conn)) => Ok(&mut **conn),
            Some(SessionConnection::Owned(conn)) => Ok(conn),
            None => Err(WardenError::Generic("Session already closed".to_string())),
        }
    }

    fn forget(&mut self, key: i64) {
        if let Some(position) = self.held.iter().rposition(|held| *held == key) {
            self.held.remove(position);
        }
    }
}

#[async_trait]
impl Session for PgSession {
    // The key is recorded before the query is sent: a session dropped while
    // the request is in flight may already hold the lock on the server
    async fn advisory_lock(&mut self, key: i64) -> Result<()> {
        self.conn()?;
        self.held.push(key);
        let locked = sqlx::query(ADVISORY_LOCK).bind(key).execute(self.conn()?).await;
        if let Err(e) = locked {
            self.forget(key);
            return Err(e.into());
        }
        Ok(())
    }

    async fn try_advisory_lock(&mut self, key: i64) -> Result<bool> {
        self.conn()?;
        self.held.push(key);
        let acquired = sqlx::query_scalar::<_, bool>(TRY_ADVISORY_LOCK)
            .bind(key)
            .fetch_one(self.conn()?)
            .await;
        match acquired {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.forget(key);
                Ok(false)
            }
            Err(e) => {
                self.forget(key);
                Err(e.into())
            }
        }
    }

    async fn advisory_unlock(&mut self, key: i64) -> Result<()> {
        let released: bool = sqlx::query_scalar(ADVISORY_UNLOCK)
            .bind(key)
            .fetch_one(self.conn()?)
            .await?;
        self.forget(key);
        if released {
            Ok(())
        } else {
            Err(WardenError::Lock(format!(
                "Advisory lock {} was not held by this session",
                key
            )))
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn()?.execute(sql).await?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn()?.execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn()?.execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn()?.execute("ROLLBACK").await?;
        Ok(())
    }

    async fn ensure_migration_table(&mut self) -> Result<()> {
        self.conn()?.execute(CREATE_MIGRATION_TABLE).await?;
        Ok(())
    }

    async fn applied_migrations(&mut self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(SELECT_APPLIED_MIGRATIONS)
            .fetch_all(self.conn()?)
            .await?;
        Ok(names)
    }

    async fn record_migration(&mut self, name: &str) -> Result<()> {
        sqlx::query(INSERT_MIGRATION)
            .bind(name)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        let abandoned = std::mem::take(&mut self.held);
        match self.connection.take() {
            Some(SessionConnection::Pooled(conn)) if !abandoned.is_empty() => {
                log::warn!(
                    "Closing connection still holding advisory locks {:?} instead of pooling it",
                    abandoned
                );
                conn.detach().close().await?;
            }
            Some(SessionConnection::Pooled(conn)) => drop(conn),
            Some(SessionConnection::Owned(conn)) => conn.close().await?,
            None => {}
        }
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if let Some(SessionConnection::Pooled(conn)) = self.connection.take() {
            log::warn!(
                "Session dropped holding advisory locks {:?}; discarding its connection",
                self.held
            );
            drop(conn.detach());
        }
    }
}
