//! Ingest orchestration: configuration, normalization, the multi-host pipeline,
//! run reports and the optional cron scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use catmirror_adapters::FixtureTransport;
use catmirror_core::RetentionWindow;
use catmirror_storage::{
    CheckpointManager, Clock, HttpTransport, MirrorStore, PgMirrorStore, RegionalClient, RegionalRouter,
    ResilienceClient, ReqwestTransport, ResumeToken, ShutdownSignal, SystemClock,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod normalize;
pub mod pipeline;
pub mod report;

pub use config::{CatalogSourceConfig, SourceRegistry, SyncConfig, APP_TOKEN_HEADER};
pub use normalize::{normalize_all, DecidedBy, NormalizeOutput, NormalizeStats};
pub use pipeline::{
    run_ingest, ErrorKind, HostError, HostOutcome, HostPlan, HostStatus, IngestContext, IngestError, IngestOptions,
    IngestResult,
};

pub const CRATE_NAME: &str = "catmirror-sync";

/// Per-invocation overrides on top of [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Hosts to ingest; empty means every enabled source.
    pub hosts: Vec<String>,
    pub retention: Option<RetentionWindow>,
    pub include_stale: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceListing {
    pub key: String,
    pub display_name: String,
    pub host: String,
    pub enabled: bool,
    pub region: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointStatus {
    pub pipeline_id: String,
    pub last_processed_at: DateTime<Utc>,
    pub completed: Option<bool>,
    pub cursor: Option<String>,
    pub committed_records: Option<u64>,
    /// Set when the stored token does not decode.
    pub problem: Option<String>,
}

pub struct SyncRunner {
    config: SyncConfig,
    registry: SourceRegistry,
    store: Arc<dyn MirrorStore>,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Arc<dyn Clock>,
    running: Mutex<()>,
}

impl SyncRunner {
    pub fn new(config: SyncConfig, registry: SourceRegistry, store: Arc<dyn MirrorStore>) -> Self {
        Self {
            config,
            registry,
            store,
            transport: None,
            clock: Arc::new(SystemClock),
            running: Mutex::new(()),
        }
    }

    /// Loads the source registry and connects to Postgres.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path)?;
        let store = PgMirrorStore::connect(&config.database_url)
            .await
            .context("connecting to the mirror database")?;
        Ok(Self::new(config, registry, Arc::new(store)))
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>, clock: Arc<dyn Clock>) -> Self {
        self.transport = Some(transport);
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MirrorStore> {
        &self.store
    }

    fn transport(&self) -> Result<Arc<dyn HttpTransport>> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }
        if let Some(dir) = &self.config.fixtures_dir {
            info!(fixtures = %dir.display(), "serving catalog pages from fixtures");
            return Ok(Arc::new(FixtureTransport::new(dir.clone())));
        }
        Ok(Arc::new(ReqwestTransport::new(&self.config.http_client_config())?))
    }

    /// Fresh per-run context: a new router snapshot and resilience client.
    pub fn context(&self) -> Result<IngestContext> {
        let resilience = ResilienceClient::new(
            self.transport()?,
            Arc::clone(&self.clock),
            &self.config.http_client_config(),
        );
        let router = RegionalRouter::new(self.registry.region_config())?;
        let client = RegionalClient::new(Arc::new(resilience), Arc::new(router));
        Ok(IngestContext::new(
            Arc::new(client),
            CheckpointManager::new(Arc::clone(&self.store)),
        ))
    }

    pub fn plans(&self, hosts: &[String]) -> Vec<HostPlan> {
        self.registry
            .select(hosts)
            .iter()
            .map(|source| HostPlan {
                settings: source.settings(),
                fetch: source.fetch_options(),
            })
            .collect()
    }

    pub fn options(&self, request: &RunRequest, shutdown: ShutdownSignal) -> IngestOptions {
        IngestOptions {
            batch_size: self.config.batch_size,
            max_concurrent_hosts: self.config.max_concurrent_hosts,
            retention: request.retention.unwrap_or(self.config.retention),
            include_stale: request.include_stale.unwrap_or(self.config.include_stale),
            headers: self.config.request_headers(),
            shutdown,
        }
    }

    /// One ingest run. Overlapping runs on the same runner are refused so a host
    /// never has two writers.
    pub async fn run_once(&self, request: &RunRequest, shutdown: ShutdownSignal) -> Result<IngestResult> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| anyhow::anyhow!("an ingest run is already in progress"))?;
        let ctx = self.context()?;
        let plans = self.plans(&request.hosts);
        let options = self.options(request, shutdown);
        let result = run_ingest(&ctx, plans, &options).await;

        if let Some(root) = &self.config.reports_dir {
            let dir = report::write_run_report(root, &result).await?;
            info!(run_id = %result.run_id, reports = %dir.display(), "run report written");
        }
        Ok(result)
    }

    pub fn source_listing(&self) -> Result<Vec<SourceListing>> {
        let router = RegionalRouter::new(self.registry.region_config())?;
        self.registry
            .sources
            .iter()
            .map(|source| -> Result<SourceListing> {
                let endpoint = router.resolve_endpoint(&source.host)?;
                Ok(SourceListing {
                    key: source.key.clone(),
                    display_name: source.display_name.clone(),
                    host: source.host.clone(),
                    enabled: source.enabled,
                    region: endpoint.region,
                    base_url: endpoint.base_url,
                })
            })
            .collect()
    }

    pub async fn checkpoint_status(&self) -> Result<Vec<CheckpointStatus>> {
        let states = self.store.checkpoints().await.context("loading checkpoints")?;
        Ok(states
            .into_iter()
            .map(|state| match ResumeToken::decode(&state.pipeline_id, &state.resume_token) {
                Ok(token) => CheckpointStatus {
                    pipeline_id: state.pipeline_id,
                    last_processed_at: state.last_processed_at,
                    completed: Some(token.completed),
                    cursor: Some(token.cursor.describe()),
                    committed_records: Some(token.committed_records),
                    problem: None,
                },
                Err(err) => CheckpointStatus {
                    pipeline_id: state.pipeline_id,
                    last_processed_at: state.last_processed_at,
                    completed: None,
                    cursor: None,
                    committed_records: None,
                    problem: Some(err.to_string()),
                },
            })
            .collect())
    }
}

/// Cron scheduler running full ingests, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(runner: Arc<SyncRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = runner.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            match runner.run_once(&RunRequest::default(), ShutdownSignal::never()).await {
                Ok(result) if result.is_success() => {
                    info!(run_id = %result.run_id, processed = result.total_processed, "scheduled ingest finished")
                }
                Ok(result) => warn!(
                    run_id = %result.run_id,
                    failed_hosts = result.errors.len(),
                    "scheduled ingest finished with host errors"
                ),
                Err(err) => error!(error = %err, "scheduled ingest did not run"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
