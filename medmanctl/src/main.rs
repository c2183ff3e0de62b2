use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use medman_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use medman_core::catalog::{CatalogItem, InMemoryCatalog, MediaAttributes};
use medman_core::duplicates::HashedItem;
use medman_core::job::JobState;
use medman_core::store::{InMemoryJobStore, JobStore, RedisJobStore};
use medman_core::{ControlPlane, OperationOutcome};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "medmanctl", about = "Operate medman processing queues")]
struct Cli {
    /// Pipeline configuration file (TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show job counts, the pause flag and active jobs
    Counts {
        /// Queue name; every known queue when omitted
        queue: Option<String>,
    },
    /// List jobs in one state
    Jobs {
        queue: String,
        #[arg(long, default_value = "failed")]
        state: JobState,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Stop workers from claiming new jobs
    Pause { queue: String },
    /// Let workers claim jobs again
    Resume { queue: String },
    /// Remove every job in a state
    Reset { queue: String, state: JobState },
    /// Resubmit every job in a state under a new method
    Requeue {
        queue: String,
        state: JobState,
        method: String,
    },
    /// Submit one job per catalog item
    Backfill {
        queue: String,
        /// JSON array of catalog items
        #[arg(long)]
        catalog: PathBuf,
        /// Processing method; the queue default when omitted
        #[arg(long)]
        method: Option<String>,
    },
    /// Submit a single item ahead of backfilled work
    Enqueue {
        queue: String,
        item: String,
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        size_bytes: Option<u64>,
        /// Extra payload field as key=value; repeatable
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Group near-identical visual hashes
    Duplicates {
        /// JSON array of {"id", "hash"} objects
        #[arg(long)]
        hashes: PathBuf,
        #[arg(long)]
        max_distance: Option<u32>,
        /// Only list items similar to this id
        #[arg(long)]
        similar_to: Option<String>,
    },
    /// Print the effective configuration and where it came from
    Config,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an outcome and map it to the process exit code.
fn emit<T: Serialize>(outcome: OperationOutcome<T>) -> Result<ExitCode> {
    print_json(&outcome)?;
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn connect(load: &ConfigLoad) -> Result<Arc<RedisJobStore>> {
    let redis = &load.config.redis;
    let store = RedisJobStore::new(&redis.url, &redis.key_prefix)
        .await
        .with_context(|| format!("failed to connect to {}", redis.url))?;
    Ok(Arc::new(store))
}

type Control<S> = ControlPlane<S, InMemoryCatalog>;

fn control_plane<S: JobStore>(
    store: Arc<S>,
    catalog: InMemoryCatalog,
    load: &ConfigLoad,
) -> Control<S> {
    ControlPlane::new(store, Arc::new(catalog), load.config.clone())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let load = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config,
        env_file: cli.env_file,
    })
    .load()
    .context("failed to load configuration")?;
    debug!(source = %load.source, env_file = load.env_file_loaded, "configuration loaded");

    match cli.command {
        Command::Config => {
            print_json(&json!({
                "source": load.source,
                "env_file_loaded": load.env_file_loaded,
                "warnings": load.warnings,
                "config": load.config,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Duplicates {
            hashes,
            max_distance,
            similar_to,
        } => {
            let items: Vec<HashedItem> = read_json(&hashes)?;
            // Clustering needs no broker.
            let control = control_plane(
                Arc::new(InMemoryJobStore::new()),
                InMemoryCatalog::new(Vec::new()),
                &load,
            );
            match similar_to {
                Some(id) => {
                    let target = items
                        .iter()
                        .find(|item| item.id == id)
                        .ok_or_else(|| anyhow!("no item with id {id} in {}", hashes.display()))?;
                    emit(control.find_similar(target, &items, max_distance))
                }
                None => emit(control.compute_duplicate_groups(&items, max_distance)),
            }
        }
        Command::Backfill {
            queue,
            catalog,
            method,
        } => {
            let items: Vec<CatalogItem> = read_json(&catalog)?;
            let control = control_plane(connect(&load).await?, InMemoryCatalog::new(items), &load);
            emit(control.enqueue_backfill(&queue, method.as_deref()).await)
        }
        command => {
            let control = control_plane(
                connect(&load).await?,
                InMemoryCatalog::new(Vec::new()),
                &load,
            );
            run_admin(&control, &load, command).await
        }
    }
}

async fn run_admin<S: JobStore>(
    control: &Control<S>,
    load: &ConfigLoad,
    command: Command,
) -> Result<ExitCode> {
    match command {
        Command::Counts { queue: Some(queue) } => emit(control.get_queue_counts(&queue).await),
        Command::Counts { queue: None } => {
            let mut all = Vec::new();
            let mut success = true;
            for queue in load.config.queue_names() {
                let outcome = control.get_queue_counts(&queue).await;
                success &= outcome.success;
                all.push(outcome);
            }
            print_json(&all)?;
            Ok(if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Jobs {
            queue,
            state,
            offset,
            limit,
        } => emit(control.list_jobs(&queue, state, offset, limit).await),
        Command::Pause { queue } => emit(control.set_paused(&queue, true).await),
        Command::Resume { queue } => emit(control.set_paused(&queue, false).await),
        Command::Reset { queue, state } => emit(control.reset_state(&queue, state).await),
        Command::Requeue {
            queue,
            state,
            method,
        } => emit(control.requeue_with_method(&queue, state, &method).await),
        Command::Enqueue {
            queue,
            item,
            method,
            size_bytes,
            fields,
        } => {
            let mut item = CatalogItem::new(item).with_attributes(MediaAttributes {
                size_bytes,
                ..MediaAttributes::default()
            });
            for (key, value) in fields {
                item = item.with_field(key, Value::String(value));
            }
            emit(control.enqueue_item(&queue, &item, method.as_deref()).await)
        }
        Command::Config | Command::Duplicates { .. } | Command::Backfill { .. } => {
            Err(anyhow!("command does not operate on a queue"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    run(cli).await
}
