//! Operator CLI over a courier job database.
//!
//! Works directly on the SQLite store; run it while the application is
//! stopped, or accept that a running manager may pick records up first.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use courier_infra::config::StorageConfig;
use courier_infra::jobs::definitions::JobKind;
use courier_infra::jobs::{JobDescriptor, JobId, JobState, JobStore, MigrationMarkerStore, SqliteJobStore};
use courier_observability::LogConfig;

/// Inspect and manage persisted background jobs
#[derive(Parser)]
#[command(name = "courier-jobctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Job database path (defaults to COURIER_JOB_DB, then courier-jobs.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted jobs in submission order
    List {
        /// Only jobs on this queue
        #[arg(long)]
        queue: Option<String>,
    },
    /// Count jobs by state and factory
    Stats,
    /// Remove a job that is not running
    Cancel {
        id: JobId,
    },
    /// Show or set the applied migration version
    Migrations {
        #[arg(long)]
        set: Option<u32>,
    },
}

#[derive(Debug, Serialize)]
struct JobRow {
    id: String,
    sequence: u64,
    factory_key: String,
    known: bool,
    queue: Option<String>,
    state: &'static str,
    attempts: u32,
    next_run_at: Option<String>,
    expires_at: Option<String>,
}

impl From<&JobDescriptor> for JobRow {
    fn from(job: &JobDescriptor) -> Self {
        Self {
            id: job.id.to_string(),
            sequence: job.sequence,
            factory_key: job.factory_key.clone(),
            known: JobKind::from_factory_key(&job.factory_key).is_some(),
            queue: job.queue_key.clone(),
            state: job.state.as_str(),
            attempts: job.attempt_count,
            next_run_at: job.next_run_at.map(|t| t.to_rfc3339()),
            expires_at: job.expires_at().map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct StoreStats {
    total: usize,
    by_state: BTreeMap<&'static str, usize>,
    by_factory: BTreeMap<String, usize>,
    expired: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env().context("invalid logging configuration")?;
    courier_observability::init(&log_config);

    let path = match cli.db {
        Some(path) => path,
        None => {
            StorageConfig::from_env()
                .context("invalid storage configuration")?
                .job_db_path
        }
    };
    let store = SqliteJobStore::open(&path)
        .with_context(|| format!("failed to open job database {}", path.display()))?;

    match cli.command {
        Commands::List { queue } => {
            let rows: Vec<JobRow> = store
                .all()?
                .iter()
                .filter(|job| queue.is_none() || job.queue_key == queue)
                .map(JobRow::from)
                .collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_table(&rows);
            }
        }
        Commands::Stats => {
            let now = chrono::Utc::now();
            let mut stats = StoreStats::default();
            for job in store.all()? {
                stats.total += 1;
                *stats.by_state.entry(job.state.as_str()).or_default() += 1;
                *stats.by_factory.entry(job.factory_key.clone()).or_default() += 1;
                if job.is_expired(now) {
                    stats.expired += 1;
                }
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("total: {}  expired: {}", stats.total, stats.expired);
                for (state, count) in &stats.by_state {
                    println!("  state {state:<14} {count}");
                }
                for (factory, count) in &stats.by_factory {
                    println!("  factory {factory:<30} {count}");
                }
            }
        }
        Commands::Cancel { id } => {
            let Some(job) = store.get(id)? else {
                bail!("no job with id {id}");
            };
            if job.state == JobState::Running {
                bail!("job {id} is running and cannot be cancelled");
            }
            if !store.remove_pending(id)? {
                bail!("job {id} started before it could be cancelled");
            }
            info!(job_id = %id, factory_key = %job.factory_key, "job cancelled");
            println!("cancelled {id}");
        }
        Commands::Migrations { set } => {
            if let Some(version) = set {
                store.set_version(version)?;
                info!(version, "migration marker set");
            }
            let version = store.version()?;
            if cli.json {
                println!("{}", serde_json::json!({ "version": version }));
            } else {
                println!("migration version: {version}");
            }
        }
    }

    Ok(())
}

fn print_table(rows: &[JobRow]) {
    println!(
        "{:<36}  {:>6}  {:<28}  {:<24}  {:<13}  {:>8}",
        "ID", "SEQ", "FACTORY", "QUEUE", "STATE", "ATTEMPTS"
    );
    for row in rows {
        let factory = if row.known {
            row.factory_key.clone()
        } else {
            format!("{}*", row.factory_key)
        };
        println!(
            "{:<36}  {:>6}  {:<28}  {:<24}  {:<13}  {:>8}",
            row.id,
            row.sequence,
            factory,
            row.queue.as_deref().unwrap_or("-"),
            row.state,
            row.attempts
        );
    }
}
