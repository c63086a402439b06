//! Vitalsync CLI
//!
//! Inspect and drive the local sync store.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use vitalsync::auth::StaticTokenProvider;
use vitalsync::storage::{KeyValueStore, RecordStore};
use vitalsync::sync::cloud::change_token_key;
use vitalsync::{StorageMode, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(name = "vitalsync")]
#[command(about = "Offline-first health data sync")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(long, env = "VITALSYNC_DB_PATH", default_value = "~/.local/share/vitalsync/sync.db")]
    db_path: String,

    /// Storage mode (local, cloud-safe)
    #[arg(long, env = "VITALSYNC_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// JSON configuration file
    #[arg(long, env = "VITALSYNC_CONFIG")]
    config: Option<String>,

    /// Backend API base URL
    #[arg(long, env = "VITALSYNC_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, env = "VITALSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pending counts and queue depth per entity
    Status,
    /// List queued offline operations
    Queue,
    /// List dead-lettered operations
    DeadLetters,
    /// Move a dead-lettered operation back into the queue
    Requeue {
        /// Operation ID
        id: Uuid,
    },
    /// Drop every queued operation
    ClearQueue,
    /// Mark every record pending and forget cloud change tokens
    Resync,
    /// Push pending records, pull remote changes and replay the queue
    Sync,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = shellexpand::tilde(path).to_string();
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path))?
        }
        None => SyncConfig::default(),
    };

    config.storage.db_path = cli.db_path.clone();
    config.storage.storage_mode = match cli.storage_mode.as_str() {
        "cloud-safe" => StorageMode::CloudSafe,
        _ => StorageMode::Local,
    };
    if let Some(url) = &cli.api_url {
        config.api.base_url = url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = load_config(&cli)?;
    let online = matches!(cli.command, Commands::Sync);
    let engine = SyncEngine::builder()
        .config(config)
        .auth(Arc::new(StaticTokenProvider::new(cli.token.clone())))
        .online(online)
        .build()
        .context("opening sync engine")?;

    match cli.command {
        Commands::Status => {
            let overview = engine.refresh_overview()?;
            println!("{}", serde_json::to_string_pretty(&overview)?);
        }

        Commands::Queue => {
            let ops = engine.queue().pending()?;
            if ops.is_empty() {
                println!("Queue is empty");
            }
            for op in ops {
                println!(
                    "{} [{}] priority={} retries={} {}",
                    op.id,
                    op.operation_type.as_str(),
                    op.priority,
                    op.retry_count,
                    op.last_error.as_deref().unwrap_or("")
                );
            }
        }

        Commands::DeadLetters => {
            for letter in engine.queue().dead_letters()? {
                println!(
                    "{} [{}] at {}: {}",
                    letter.operation.id,
                    letter.operation.operation_type.as_str(),
                    letter.dead_lettered_at.to_rfc3339(),
                    letter.error
                );
            }
        }

        Commands::Requeue { id } => {
            let op = engine.queue().requeue_dead_letter(id)?;
            println!("Requeued {}", op.id);
        }

        Commands::ClearQueue => {
            let removed = engine.queue().clear_queue()?;
            println!("Removed {} operations", removed);
        }

        Commands::Resync => {
            let storage = engine.storage();
            let reset = storage.reset_sync_status()?;
            let zone = &engine.config().cloud.zone_name;
            storage.remove_value(&change_token_key(zone))?;
            println!("Marked {} records pending", reset);
        }

        Commands::Sync => {
            for (entity, result) in engine.sync_all().await? {
                match result {
                    Ok(report) => println!(
                        "push {}: {} synced, {} failed",
                        entity, report.synced, report.failed
                    ),
                    Err(e) => println!("push {}: error: {}", entity, e),
                }
            }
            for (entity, result) in engine.pull_all().await? {
                match result {
                    Ok(report) => println!(
                        "pull {}: {} fetched, {} applied",
                        entity,
                        report.fetched,
                        report.merge.applied()
                    ),
                    Err(e) => println!("pull {}: error: {}", entity, e),
                }
            }
            let run = engine.queue().process_queue().await?;
            println!(
                "queue: {} sent, {} failed, {} dead-lettered",
                run.succeeded, run.failed, run.dead_lettered
            );
        }
    }

    Ok(())
}
