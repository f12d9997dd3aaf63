use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use crmsync_adapters::{CrmSource, FixtureCrmSource};
use crmsync_storage::{MemoryStore, PgStore, RunLog, TableStore};
use crmsync_sync::{ObjectRegistry, SyncConfig, SyncEngine};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "crmsync")]
#[command(about = "Mirror CRM objects and their schema into a local warehouse")]
struct Cli {
    /// Serve CRM objects from fixture JSON files in this directory instead of the CRM API
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    /// Keep tables and the run log in memory instead of Postgres
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Incremental sync of one object, or a full re-pull with --full
    Sync {
        #[arg(long)]
        object: String,
        #[arg(long, conflicts_with = "since")]
        full: bool,
        /// RFC 3339 lower bound overriding the stored watermark
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },
    /// Sync a single page of one object
    SyncPage {
        #[arg(long)]
        object: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
    /// Incremental sync of every enabled object
    SyncAll,
    /// Apply additive schema changes for one object, or all enabled objects
    Reconcile {
        #[arg(long)]
        object: Option<String>,
    },
    /// Most recent sync runs
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Row counts and last sync times per table
    Stats,
    /// Apply run-log migrations
    Migrate,
    /// Run sync-all on the configured cron schedule until interrupted
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if matches!(std::env::var("CRMSYNC_LOG_FORMAT").as_deref(), Ok("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("rendering output")?);
    Ok(())
}

async fn connect_postgres(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, &config.db_schema).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn build_engine(cli: &Cli, config: SyncConfig) -> Result<Arc<SyncEngine>> {
    let registry = ObjectRegistry::load(&config.registry_path()).await?;

    let source: Arc<dyn CrmSource> = match &cli.fixtures {
        Some(dir) => Arc::new(FixtureCrmSource::from_dir(dir)?),
        None => crmsync_sync::http_source(&config)?,
    };

    let (tables, runs): (Arc<dyn TableStore>, Arc<dyn RunLog>) = if cli.memory {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store)
    } else {
        let store = connect_postgres(&config).await?;
        (store.clone(), store)
    };

    Ok(Arc::new(SyncEngine::new(config, registry, source, tables, runs)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    if matches!(cli.command, Commands::Migrate) && cli.memory {
        bail!("migrate targets Postgres; drop --memory");
    }

    let engine = build_engine(&cli, config).await?;
    match &cli.command {
        Commands::Sync {
            object,
            full,
            since,
        } => {
            let run = if *full {
                engine.run_full(object).await?
            } else {
                engine.run_incremental(object, *since).await?
            };
            print_json(&run)?;
        }
        Commands::SyncPage {
            object,
            offset,
            limit,
        } => {
            let run = engine.run_page(object, *offset, *limit).await?;
            print_json(&run)?;
        }
        Commands::SyncAll => print_json(&engine.run_all_enabled().await)?,
        Commands::Reconcile { object: Some(object) } => print_json(&engine.reconcile(object).await?)?,
        Commands::Reconcile { object: None } => print_json(&engine.reconcile_all().await)?,
        Commands::Status { limit } => print_json(&engine.status(*limit).await?)?,
        Commands::Stats => print_json(&engine.stats().await?)?,
        Commands::Schedule => {
            let Some(mut sched) = engine.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled; set CRMSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %engine.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        // Connecting the Postgres store already applied the migrations.
        Commands::Migrate => {
            print_json(&json!({"migrated": true, "schema": engine.config().db_schema}))?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::parse_from([
            "crmsync",
            "--memory",
            "sync",
            "--object",
            "supplier__c",
            "--since",
            "2025-10-01T00:00:00Z",
        ]);
        assert!(cli.memory);
        match cli.command {
            Commands::Sync { object, full, since } => {
                assert_eq!(object, "supplier__c");
                assert!(!full);
                assert_eq!(since.unwrap().timestamp(), 1_759_276_800);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn full_and_since_conflict() {
        let err = Cli::try_parse_from([
            "crmsync", "sync", "--object", "a", "--full", "--since", "2025-10-01T00:00:00Z",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::parse_from(["crmsync", "sync-page", "--object", "a", "--fixtures", "fixtures/crm"]);
        assert_eq!(cli.fixtures, Some(PathBuf::from("fixtures/crm")));
        assert!(matches!(cli.command, Commands::SyncPage { offset: 0, limit: 100, .. }));
    }
}
