//! Two-tier lock coordination
//!
//! A named lock is held in two places at once: an in-process tokio mutex
//! serializes callers within this process, and a session-scoped advisory
//! lock serializes processes sharing the database. Advisory locks belong to
//! the session that took them, so the coordinator reserves one connection
//! for the whole critical section and releases the lock on that same
//! connection.

use crate::error::Result;
use crate::lock::NamedLock;
use crate::storage::{SchemaBackend, Session};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, watch};

struct LocalLock {
    mutex: Mutex<()>,
    busy: watch::Sender<bool>,
}

impl LocalLock {
    fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            mutex: Mutex::new(()),
            busy,
        }
    }
}

/// Serializes schema operations within and across processes
pub struct LockCoordinator {
    backend: Arc<dyn SchemaBackend>,
    locals: [LocalLock; NamedLock::COUNT],
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn SchemaBackend>) -> Self {
        Self {
            backend,
            locals: std::array::from_fn(|_| LocalLock::new()),
        }
    }

    fn local(&self, lock: NamedLock) -> &LocalLock {
        &self.locals[lock.ordinal()]
    }

    /// Take both tiers of `lock`, waiting as long as needed
    ///
    /// The local mutex is taken first, then a dedicated connection, then the
    /// advisory lock on it.
    pub async fn acquire(&self, lock: NamedLock) -> Result<LockGuard<'_>> {
        let local = self.local(lock);

        log::debug!("Waiting for local lock {}", lock);
        let permit = local.mutex.lock().await;
        local.busy.send_replace(true);

        let mut guard = LockGuard {
            lock,
            session: None,
            busy: &local.busy,
            _permit: permit,
        };

        let mut session = self.backend.dedicated().await?;
        log::debug!("Waiting for advisory lock {} ({})", lock, lock.id());
        session.advisory_lock(lock.id()).await?;
        guard.session = Some(session);

        log::info!("Acquired lock {}", lock);
        Ok(guard)
    }

    /// Run `operation` while holding `lock`
    ///
    /// The lock is released whether the operation succeeds or fails. When
    /// both the operation and the release fail, the release failure is
    /// logged and the operation's error is returned.
    pub async fn with_lock<T, F, Fut>(&self, lock: NamedLock, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(lock).await?;
        let outcome = operation().await;
        let released = guard.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => {
                log::error!("Failed to release lock {}: {}", lock, e);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                log::error!(
                    "Failed to release lock {} after failed operation: {}",
                    lock,
                    release_err
                );
                Err(e)
            }
        }
    }

    /// Probe the advisory lock without waiting
    ///
    /// Only the database tier is checked. A lock obtained by the probe is
    /// released before returning, so `true` means "free at this instant".
    pub async fn try_lock(&self, lock: NamedLock) -> Result<bool> {
        let mut session = self.backend.dedicated().await?;
        let acquired = session.try_advisory_lock(lock.id()).await?;
        if acquired {
            session.advisory_unlock(lock.id()).await?;
        }
        session.close().await?;

        log::debug!("Probed lock {}: {}", lock, if acquired { "free" } else { "held" });
        Ok(acquired)
    }

    /// Whether a caller in this process currently holds `lock`
    pub fn is_busy(&self, lock: NamedLock) -> bool {
        *self.local(lock).busy.borrow()
    }

    /// Wait until no caller in this process holds `lock`
    ///
    /// Takes nothing itself; another caller may acquire the lock right after
    /// this returns.
    pub async fn wait(&self, lock: NamedLock) {
        let mut busy = self.local(lock).busy.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = busy.wait_for(|held| !*held).await;
    }
}

/// Both tiers of a held lock
///
/// [`LockGuard::release`] unlocks on the reserved connection and reports
/// failures. A guard dropped without release (panic, cancelled task) still
/// frees the local mutex, and its session discards the connection rather
/// than pooling it, which ends the database session and its advisory lock.
pub struct LockGuard<'a> {
    lock: NamedLock,
    session: Option<Box<dyn Session>>,
    busy: &'a watch::Sender<bool>,
    _permit: MutexGuard<'a, ()>,
}

impl LockGuard<'_> {
    pub fn lock(&self) -> NamedLock {
        self.lock
    }

    /// Unlock, hand back the connection, then free the local mutex
    pub async fn release(mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let unlocked = session.advisory_unlock(self.lock.id()).await;
        let closed = session.close().await;
        log::info!("Released lock {}", self.lock);

        unlocked.and(closed)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.session.is_some() {
            log::warn!("Lock {} dropped without release", self.lock);
        }
        self.busy.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use crate::storage::MemoryBackend;

    fn coordinator() -> (MemoryBackend, LockCoordinator) {
        let backend = MemoryBackend::new();
        let coordinator = LockCoordinator::new(Arc::new(backend.clone()));
        (backend, coordinator)
    }

    #[tokio::test]
    async fn test_with_lock_releases_both_tiers() {
        let (backend, locks) = coordinator();

        let value = locks
            .with_lock(NamedLock::Migrations, || async {
                assert!(locks.is_busy(NamedLock::Migrations));
                assert!(!locks.is_busy(NamedLock::ClipIndex));
                assert_eq!(backend.held_advisory_locks(), vec![NamedLock::Migrations.id()]);
                assert!(!locks.try_lock(NamedLock::Migrations).await.unwrap());
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(!locks.is_busy(NamedLock::Migrations));
        assert!(backend.held_advisory_locks().is_empty());
        assert!(locks.try_lock(NamedLock::Migrations).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_operation_still_releases() {
        let (backend, locks) = coordinator();

        let result: Result<()> = locks
            .with_lock(NamedLock::FaceIndex, || async {
                Err(WardenError::Precondition("boom".to_string()))
            })
            .await;

        assert!(matches!(result, Err(WardenError::Precondition(_))));
        assert!(!locks.is_busy(NamedLock::FaceIndex));
        assert!(backend.held_advisory_locks().is_empty());
        assert!(locks.try_lock(NamedLock::FaceIndex).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_failure_is_reported() {
        let (backend, locks) = coordinator();
        backend.set_fail_unlock(true);

        let result = locks.with_lock(NamedLock::Migrations, || async { Ok(()) }).await;
        assert!(matches!(result, Err(WardenError::Database(_))));
        assert!(!locks.is_busy(NamedLock::Migrations));
    }

    #[tokio::test]
    async fn test_release_failure_does_not_mask_operation_error() {
        let (backend, locks) = coordinator();
        backend.set_fail_unlock(true);

        let result: Result<()> = locks
            .with_lock(NamedLock::Migrations, || async {
                Err(WardenError::Migration {
                    name: "0001_init".to_string(),
                    message: "syntax error".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(WardenError::Migration { .. })));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let (backend, locks) = coordinator();

        let guard = locks.acquire(NamedLock::ClipIndex).await.unwrap();
        assert_eq!(guard.lock(), NamedLock::ClipIndex);
        assert!(locks.is_busy(NamedLock::ClipIndex));

        drop(guard);
        assert!(!locks.is_busy(NamedLock::ClipIndex));
        assert!(backend.held_advisory_locks().is_empty());
    }

    #[tokio::test]
    async fn test_wait_without_holder_returns() {
        let (_backend, locks) = coordinator();
        locks.wait(NamedLock::Migrations).await;
        assert!(!locks.is_busy(NamedLock::Migrations));
    }
}
