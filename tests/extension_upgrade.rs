//! Extension upgrades: version deltas, restart handling and lock usage

use schema_warden::{
    DatabaseExtension, ExtensionUpgradeOrchestrator, LockCoordinator, MemoryBackend, NamedLock,
    ReindexOrchestrator, SchemaBackend, WardenError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn upgrader(backend: &MemoryBackend, active: DatabaseExtension) -> ExtensionUpgradeOrchestrator {
    let backend: Arc<dyn SchemaBackend> = Arc::new(backend.clone());
    let locks = Arc::new(LockCoordinator::new(Arc::clone(&backend)));
    let reindexer = Arc::new(
        ReindexOrchestrator::new(Arc::clone(&backend), Arc::clone(&locks), active).unwrap(),
    );
    ExtensionUpgradeOrchestrator::new(backend, locks, reindexer)
}

/// Both known indexes built with pgvecto.rs, 512-dimensional
fn seed_vectors_indexes(backend: &MemoryBackend) {
    backend.set_index(
        "clip_index",
        "smart_search",
        "CREATE INDEX clip_index ON public.smart_search USING vectors (embedding vectors.vector_cos_ops)",
    );
    backend.set_index(
        "face_index",
        "face_search",
        "CREATE INDEX face_index ON public.face_search USING vectors (embedding vectors.vector_cos_ops)",
    );
    backend.set_column_dimension("smart_search", "embedding", 512);
    backend.set_column_dimension("face_search", "embedding", 512);
}

#[tokio::test]
async fn test_major_upgrade_requires_restart_without_reindex() {
    let backend = MemoryBackend::new();
    backend.set_extension(DatabaseExtension::Vectors, Some("2.0.0"), Some("1.0.0"));
    seed_vectors_indexes(&backend);

    let result = upgrader(&backend, DatabaseExtension::Vectors)
        .update_extension(DatabaseExtension::Vectors, None)
        .await
        .unwrap();
    assert!(result.restart_required);

    let statements = backend.statements();
    let sql: Vec<&str> = statements.iter().map(|s| s.sql.as_str()).collect();
    assert_eq!(
        sql,
        vec![
            r#"SET search_path TO "$user", public, vectors"#,
            "ALTER EXTENSION vectors UPDATE TO '2.0.0'",
            "SELECT pgvectors_upgrade()",
        ]
    );
    assert!(statements.iter().all(|s| s.transaction == statements[0].transaction));
    assert!(statements[0].transaction.is_some());
    assert_eq!(
        backend.installed_version(DatabaseExtension::Vectors).as_deref(),
        Some("2.0.0")
    );
}

#[tokio::test]
async fn test_patch_upgrade_reindexes_both_indexes() {
    let backend = MemoryBackend::new();
    backend.set_extension(DatabaseExtension::Vectors, Some("1.0.1"), Some("1.0.0"));
    seed_vectors_indexes(&backend);

    let result = upgrader(&backend, DatabaseExtension::Vectors)
        .update_extension(DatabaseExtension::Vectors, None)
        .await
        .unwrap();
    assert!(!result.restart_required);

    let statements = backend.statements();
    assert!(!statements.iter().any(|s| s.sql.contains("pgvectors_upgrade")));
    for index in ["clip_index", "face_index"] {
        assert!(
            statements
                .iter()
                .any(|s| s.sql == format!("DROP INDEX IF EXISTS {}", index)),
            "{} should have been dropped",
            index
        );
        assert!(
            statements
                .iter()
                .any(|s| s.sql.starts_with(&format!("CREATE INDEX IF NOT EXISTS {} ", index))),
            "{} should have been recreated",
            index
        );
    }

    // The upgrade commits before any index is touched
    let alter = statements
        .iter()
        .position(|s| s.sql.starts_with("ALTER EXTENSION"))
        .unwrap();
    let first_drop = statements
        .iter()
        .position(|s| s.sql.starts_with("DROP INDEX"))
        .unwrap();
    assert!(alter < first_drop);
    assert!(backend.held_advisory_locks().is_empty());
}

#[tokio::test]
async fn test_not_installed_is_precondition_error() {
    let backend = MemoryBackend::new();
    backend.set_extension(DatabaseExtension::Vectors, Some("0.3.0"), None);

    let err = upgrader(&backend, DatabaseExtension::Vectors)
        .update_extension(DatabaseExtension::Vectors, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WardenError::Precondition(_)));
    assert!(backend.statements().is_empty());
}

#[tokio::test]
async fn test_update_at_latest_version_rebuilds_indexes() {
    let backend = MemoryBackend::new();
    backend.set_extension(DatabaseExtension::VectorChord, Some("0.4.1"), Some("0.4.1"));
    for (index, table) in [("clip_index", "smart_search"), ("face_index", "face_search")] {
        backend.set_index(
            index,
            table,
            &format!("CREATE INDEX {} ON public.{} USING vchordrq (embedding vector_cosine_ops)", index, table),
        );
        backend.set_column_dimension(table, "embedding", 512);
    }

    let result = upgrader(&backend, DatabaseExtension::VectorChord)
        .update_extension(DatabaseExtension::VectorChord, None)
        .await
        .unwrap();
    assert!(!result.restart_required);

    let drops: Vec<String> = backend
        .statements()
        .into_iter()
        .map(|s| s.sql)
        .filter(|sql| sql.starts_with("DROP INDEX"))
        .collect();
    assert_eq!(drops.len(), 2);
    assert!(drops.contains(&"DROP INDEX IF EXISTS clip_index".to_string()));
    assert!(drops.contains(&"DROP INDEX IF EXISTS face_index".to_string()));
    assert!(backend.held_advisory_locks().is_empty());
}

#[tokio::test]
async fn test_failed_alter_rolls_back_and_skips_reindex() {
    let backend = MemoryBackend::new();
    backend.set_extension(DatabaseExtension::Vector, Some("0.8.0"), Some("0.7.4"));
    backend.fail_on("ALTER EXTENSION");
    let upgrader = upgrader(&backend, DatabaseExtension::Vector);

    let err = upgrader
        .update_extension(DatabaseExtension::Vector, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WardenError::Database(_)));
    assert_eq!(
        backend.installed_version(DatabaseExtension::Vector).as_deref(),
        Some("0.7.4")
    );
    assert!(!backend.statements().iter().any(|s| s.sql.starts_with("DROP INDEX")));
    assert!(backend.held_advisory_locks().is_empty());
}

#[tokio::test]
async fn test_upgrade_waits_for_other_process() {
    let backend = MemoryBackend::new();
    backend.set_extension(DatabaseExtension::VectorChord, Some("0.4.2"), Some("0.4.1"));
    let other_process = LockCoordinator::new(Arc::new(backend.clone()));
    let upgrader = Arc::new(upgrader(&backend, DatabaseExtension::VectorChord));

    let guard = other_process.acquire(NamedLock::ExtensionUpgrade).await.unwrap();
    let upgrade = {
        let upgrader = Arc::clone(&upgrader);
        tokio::spawn(async move {
            upgrader
                .update_extension(DatabaseExtension::VectorChord, None)
                .await
        })
    };

    sleep(Duration::from_millis(20)).await;
    assert!(!upgrade.is_finished());
    assert!(backend.statements().is_empty());

    guard.release().await.unwrap();
    let result = timeout(Duration::from_secs(5), upgrade)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!result.restart_required);
    assert_eq!(
        backend.installed_version(DatabaseExtension::VectorChord).as_deref(),
        Some("0.4.2")
    );
}
