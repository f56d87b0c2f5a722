use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use catmirror_core::RetentionWindow;
use catmirror_storage::{shutdown_channel, MemoryMirrorStore, PgMirrorStore};
use catmirror_sync::report::recent_reports_markdown;
use catmirror_sync::{maybe_build_scheduler, RunRequest, SourceRegistry, SyncConfig, SyncRunner};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "catmirror")]
#[command(about = "Open data catalog mirror")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest catalog hosts into the mirror.
    Sync {
        /// Host to ingest; repeatable. Defaults to every enabled source.
        #[arg(long = "host")]
        hosts: Vec<String>,
        /// Retention lower bound (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
        /// Retention upper bound (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        include_stale: bool,
        /// Use an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Show configured sources and their resolved regions.
    ListSources,
    /// Show stored checkpoints.
    Status,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run ingests on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("catmirror=info,catmirror_sync=info,catmirror_storage=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = SyncConfig::from_env().context("reading configuration")?;

    match cli.command.unwrap_or(Commands::Sync {
        hosts: Vec::new(),
        since: None,
        until: None,
        include_stale: false,
        dry_run: false,
    }) {
        Commands::Sync {
            hosts,
            since,
            until,
            include_stale,
            dry_run,
        } => {
            let retention = if since.is_some() || until.is_some() {
                Some(RetentionWindow::parse(
                    since.as_deref(),
                    until.as_deref(),
                    chrono::Utc::now().date_naive(),
                )?)
            } else {
                None
            };
            let request = RunRequest {
                hosts,
                retention,
                include_stale: include_stale.then_some(true),
            };
            let runner = if dry_run {
                let registry = load_registry(&config)?;
                SyncRunner::new(config, registry, Arc::new(MemoryMirrorStore::new()))
            } else {
                SyncRunner::connect(config).await?
            };

            let (trigger, shutdown) = shutdown_channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current page");
                    trigger.trigger();
                }
            });

            let result = runner.run_once(&request, shutdown).await?;
            println!(
                "sync complete: run_id={} processed={} completed_hosts={} failed_hosts={}",
                result.run_id,
                result.total_processed,
                result.completed_hosts.len(),
                result.errors.len()
            );
            for err in &result.errors {
                println!("  {} [{:?}] {}", err.host, err.kind, err.message);
            }
            Ok(ExitCode::from(result.exit_code() as u8))
        }
        Commands::Migrate => {
            let store = PgMirrorStore::connect(&config.database_url)
                .await
                .context("connecting to the mirror database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::ListSources => {
            let registry = load_registry(&config)?;
            let runner = SyncRunner::new(config, registry, Arc::new(MemoryMirrorStore::new()));
            for source in runner.source_listing()? {
                println!(
                    "{}\t{}\t{}\t{}\t{}{}",
                    source.key,
                    source.display_name,
                    source.host,
                    source.region,
                    source.base_url,
                    if source.enabled { "" } else { "\t(disabled)" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let runner = SyncRunner::connect(config).await?;
            for status in runner.checkpoint_status().await? {
                println!("{}", serde_json::to_string(&status)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report { runs } => {
            let root = config
                .reports_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("reports"));
            println!("{}", recent_reports_markdown(&root, runs)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let runner = Arc::new(SyncRunner::connect(config).await?);
            let Some(mut sched) = maybe_build_scheduler(runner).await? else {
                anyhow::bail!("scheduler disabled; set CATMIRROR_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_registry(config: &SyncConfig) -> Result<SourceRegistry> {
    SourceRegistry::load(&config.sources_path)
}
