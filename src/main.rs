//! schema-warden CLI application
//!
//! Command-line interface for the schema-warden library.

use anyhow::Context;
use clap::{Parser, Subcommand};
use schema_warden::extension::create_index_statement;
use schema_warden::storage::PgBackend;
use schema_warden::{Config, DatabaseExtension, NamedLock, SchemaManager, VectorIndex, VersionResolver};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "schema-warden")]
#[command(about = "Coordinated schema migrations and vector index management for PostgreSQL")]
#[command(version)]
struct Cli {
    /// JSON configuration file; DB_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check versions, install or upgrade the vector extension, migrate and reindex
    Bootstrap,

    /// Apply pending migrations
    Migrate {
        /// Only list the migrations that would run
        #[arg(long)]
        pending: bool,
    },

    /// Update the active vector extension
    UpgradeExtension {
        /// Target version, defaults to the newest available
        #[arg(long = "to")]
        target: Option<String>,
    },

    /// Rebuild vector indexes
    Reindex {
        /// Indexes to rebuild (clip, face); rebuilds drifted indexes when empty
        indexes: Vec<VectorIndex>,
    },

    /// Report indexes that no longer match the active extension
    CheckDrift,

    /// Show server and extension versions
    Versions,

    /// Print the index creation statement for an extension
    IndexSql {
        /// Vector extension (vchord, vectors, vector)
        #[arg(short, long)]
        extension: DatabaseExtension,

        /// Index to build
        #[arg(short, long, default_value = "clip")]
        index: VectorIndex,
    },

    /// Check whether a named lock is currently free
    ProbeLock {
        /// Lock name (migrations, extension-upgrade, clip-index, face-index)
        lock: NamedLock,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Bootstrap => bootstrap_command(config).await?,
        Commands::Migrate { pending } => migrate_command(config, pending).await?,
        Commands::UpgradeExtension { target } => upgrade_command(config, target).await?,
        Commands::Reindex { indexes } => reindex_command(config, indexes).await?,
        Commands::CheckDrift => check_drift_command(config).await?,
        Commands::Versions => versions_command(config).await?,
        Commands::IndexSql { extension, index } => index_sql_command(extension, index)?,
        Commands::ProbeLock { lock } => probe_lock_command(config, lock).await?,
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

async fn bootstrap_command(config: Config) -> anyhow::Result<()> {
    println!("🚀 Bootstrapping database schema...");

    let manager = SchemaManager::connect(config).await?;
    let report = manager.bootstrap().await?;

    println!("✅ Bootstrap complete!");
    println!("   🐘 PostgreSQL: {}", report.postgres_version);
    println!(
        "   🧩 Extension: {} {}",
        report.extension.display_name(),
        report.extension_version.as_deref().unwrap_or("unknown")
    );
    if report.extension_created {
        println!("   ➕ Extension installed");
    }
    if report.extension_upgraded {
        println!("   ⬆️  Extension upgraded");
    }
    println!("   📜 Migrations applied: {}", report.migrations_applied.len());
    for name in &report.migrations_applied {
        println!("      - {}", name);
    }
    println!("   🔧 Indexes rebuilt: {}", report.reindexed.len());
    if report.restart_required {
        println!("⚠️  Restart the database to finish the extension upgrade");
    }
    Ok(())
}

async fn migrate_command(config: Config, pending_only: bool) -> anyhow::Result<()> {
    let manager = SchemaManager::connect(config).await?;

    if pending_only {
        let pending = manager.pending_migrations().await?;
        if pending.is_empty() {
            println!("✅ Database schema is up to date");
        } else {
            println!("📋 {} pending migrations:", pending.len());
            for name in pending {
                println!("   - {}", name);
            }
        }
        return Ok(());
    }

    println!("📜 Running migrations ({})...", manager.config().migrations.mode);
    let applied = manager.run_migrations().await?;
    println!("✅ Applied {} migrations", applied.len());
    for name in applied {
        println!("   - {}", name);
    }
    Ok(())
}

async fn upgrade_command(config: Config, target: Option<String>) -> anyhow::Result<()> {
    let manager = SchemaManager::connect(config).await?;
    println!(
        "⬆️  Updating {} to {}...",
        manager.extension().display_name(),
        target.as_deref().unwrap_or("the newest available version")
    );

    let result = manager.update_extension(target.as_deref()).await?;
    println!("✅ Extension updated");
    if result.restart_required {
        println!("⚠️  Restart the database before using the extension");
    }
    Ok(())
}

async fn reindex_command(config: Config, indexes: Vec<VectorIndex>) -> anyhow::Result<()> {
    let manager = SchemaManager::connect(config).await?;

    if indexes.is_empty() {
        println!("🔍 Rebuilding drifted indexes...");
        let rebuilt = manager.reindex_if_needed().await?;
        if rebuilt.is_empty() {
            println!("✅ All vector indexes are up to date");
        } else {
            for index in rebuilt {
                println!("✅ Rebuilt {}", index);
            }
        }
        return Ok(());
    }

    for index in indexes {
        println!("🔧 Rebuilding {}...", index);
        if manager.reindex(index).await? {
            println!("✅ Rebuilt {}", index);
        } else {
            println!("⏭️  Skipped {}: table not found", index);
        }
    }
    Ok(())
}

async fn check_drift_command(config: Config) -> anyhow::Result<()> {
    let manager = SchemaManager::connect(config).await?;
    println!(
        "🔍 Comparing vector indexes with {}:",
        manager.extension().display_name()
    );

    for (index, stale) in manager.check_drift().await? {
        if stale {
            println!("   ❌ {} needs a rebuild", index);
        } else {
            println!("   ✅ {} is up to date", index);
        }
    }
    Ok(())
}

async fn versions_command(config: Config) -> anyhow::Result<()> {
    let backend = PgBackend::connect(&config.database).await?;
    let resolver = VersionResolver::new(Arc::new(backend));

    let postgres = resolver.get_postgres_version().await?;
    let range = VersionResolver::get_postgres_version_range()?;
    println!("🐘 PostgreSQL {} (supported: {})", postgres, range);

    for extension in DatabaseExtension::ALL {
        let info = resolver.get_extension_version(extension).await?;
        println!(
            "   🧩 {:<14} installed: {:<10} available: {}",
            extension.display_name(),
            info.installed_version.as_deref().unwrap_or("-"),
            info.available_version.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn index_sql_command(extension: DatabaseExtension, index: VectorIndex) -> anyhow::Result<()> {
    let statement = create_index_statement(extension, index.table(), index.name())?;
    println!("{};", statement);
    Ok(())
}

async fn probe_lock_command(config: Config, lock: NamedLock) -> anyhow::Result<()> {
    let backend = PgBackend::connect(&config.database).await?;
    let locks = schema_warden::LockCoordinator::new(Arc::new(backend));

    if locks.try_lock(lock).await? {
        println!("🔓 {} is free", lock);
    } else {
        println!("🔒 {} is held by another session", lock);
    }
    Ok(())
}
