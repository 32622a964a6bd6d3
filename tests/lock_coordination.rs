//! Lock coordination across tasks and across processes sharing a database

use schema_warden::{LockCoordinator, MemoryBackend, NamedLock, WardenError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Barrier, oneshot};
use tokio::time::{sleep, timeout};

fn process(backend: &MemoryBackend) -> Arc<LockCoordinator> {
    Arc::new(LockCoordinator::new(Arc::new(backend.clone())))
}

async fn wait_until_busy(locks: &LockCoordinator, lock: NamedLock) {
    timeout(Duration::from_secs(5), async {
        while !locks.is_busy(lock) {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("lock was never taken");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_lock_bodies_never_overlap() {
    let backend = MemoryBackend::new();
    // Two processes, each with several callers
    let processes = [process(&backend), process(&backend)];
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..8 {
        let locks = Arc::clone(&processes[i % 2]);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            locks
                .with_lock(NamedLock::Migrations, || async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(backend.held_advisory_locks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_different_locks_run_concurrently() {
    let backend = MemoryBackend::new();
    let locks = process(&backend);
    let barrier = Arc::new(Barrier::new(2));

    let run = |lock: NamedLock| {
        let locks = Arc::clone(&locks);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            locks
                .with_lock(lock, || async {
                    // Both bodies must be inside their critical sections at once
                    match timeout(Duration::from_secs(5), barrier.wait()).await {
                        Ok(_) => Ok(()),
                        Err(_) => Err(WardenError::Generic("bodies did not overlap".to_string())),
                    }
                })
                .await
        })
    };

    let clip = run(NamedLock::ClipIndex);
    let face = run(NamedLock::FaceIndex);
    clip.await.unwrap().unwrap();
    face.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_try_lock_sees_other_process() {
    let backend = MemoryBackend::new();
    let process_a = process(&backend);
    let process_b = process(&backend);
    let (release, released) = oneshot::channel::<()>();

    let holder = {
        let locks = Arc::clone(&process_a);
        tokio::spawn(async move {
            locks
                .with_lock(NamedLock::Migrations, || async {
                    let _ = released.await;
                    Ok(())
                })
                .await
        })
    };
    wait_until_busy(&process_a, NamedLock::Migrations).await;

    // The advisory tier is visible to B; the local tier is not
    assert!(!process_b.try_lock(NamedLock::Migrations).await.unwrap());
    assert!(!process_b.is_busy(NamedLock::Migrations));
    assert!(process_b.try_lock(NamedLock::ExtensionUpgrade).await.unwrap());

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();

    assert!(process_b.try_lock(NamedLock::Migrations).await.unwrap());
    assert!(!process_a.is_busy(NamedLock::Migrations));
}

#[tokio::test]
async fn test_try_lock_true_after_failed_operation() {
    let backend = MemoryBackend::new();
    let locks = process(&backend);

    let result: schema_warden::Result<()> = locks
        .with_lock(NamedLock::ExtensionUpgrade, || async {
            Err(WardenError::Precondition("not installed".to_string()))
        })
        .await;

    assert!(result.is_err());
    assert!(locks.try_lock(NamedLock::ExtensionUpgrade).await.unwrap());
    assert!(!locks.is_busy(NamedLock::ExtensionUpgrade));
}

#[tokio::test]
async fn test_wait_returns_after_release() {
    let backend = MemoryBackend::new();
    let locks = process(&backend);
    let (release, released) = oneshot::channel::<()>();

    let holder = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            locks
                .with_lock(NamedLock::ClipIndex, || async {
                    let _ = released.await;
                    Ok(())
                })
                .await
        })
    };
    wait_until_busy(&locks, NamedLock::ClipIndex).await;

    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move { locks.wait(NamedLock::ClipIndex).await })
    };
    sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    release.send(()).unwrap();
    timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    holder.await.unwrap().unwrap();
    assert!(!locks.is_busy(NamedLock::ClipIndex));
}

#[tokio::test]
async fn test_aborted_holder_releases_both_tiers() {
    let backend = MemoryBackend::new();
    let locks = process(&backend);
    let other_process = process(&backend);

    let holder = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let _guard = locks.acquire(NamedLock::FaceIndex).await?;
            std::future::pending::<()>().await;
            Ok::<(), WardenError>(())
        })
    };
    wait_until_busy(&locks, NamedLock::FaceIndex).await;
    assert!(!other_process.try_lock(NamedLock::FaceIndex).await.unwrap());

    holder.abort();
    assert!(holder.await.unwrap_err().is_cancelled());

    assert!(!locks.is_busy(NamedLock::FaceIndex));
    assert!(backend.held_advisory_locks().is_empty());
    assert!(other_process.try_lock(NamedLock::FaceIndex).await.unwrap());

    // The local mutex is usable again
    timeout(
        Duration::from_secs(5),
        locks.with_lock(NamedLock::FaceIndex, || async { Ok(()) }),
    )
    .await
    .unwrap()
    .unwrap();
}
