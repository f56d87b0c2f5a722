//! Multi-host ingest: fetch, normalize and commit per host on a bounded pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use catmirror_adapters::{source_for, CatalogSource, FetchError, FetchOptions, PaginatedFetcher, SourceSettings};
use catmirror_core::{pipeline_id_for_host, ConfigError, PageCursor, RawRecord, RetentionWindow, UpsertCounts};
use catmirror_storage::checkpoint::store_precision;
use catmirror_storage::{
    CheckpointError, CheckpointManager, Clock, RegionalClient, RequestError, ResumeToken, ShutdownSignal,
    StoreError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::normalize::{normalize_all, LatestSeen, NormalizeStats};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_MAX_CONCURRENT_HOSTS: usize = 4;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Request(RequestError),
    #[error("decoding catalog page from {url}: {message}")]
    Decode { url: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ingest of {host} cancelled")]
    Cancelled { host: String },
}

impl From<RequestError> for IngestError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Config(err) => Self::Config(err),
            other => Self::Request(other),
        }
    }
}

impl From<CheckpointError> for IngestError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Config(err) => Self::Config(err),
            CheckpointError::Store(err) => Self::Store(err),
        }
    }
}

impl IngestError {
    fn from_fetch(err: FetchError, host: &str) -> Self {
        match err {
            FetchError::Request(RequestError::Cancelled { .. }) => Self::Cancelled {
                host: host.to_string(),
            },
            FetchError::Request(err) => err.into(),
            FetchError::Decode { url, source } => Self::Decode {
                url,
                message: source.to_string(),
            },
            FetchError::Config(err) => Self::Config(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Request(RequestError::RetryExhausted { .. }) => ErrorKind::RetryExhausted,
            Self::Request(RequestError::Client { .. }) => ErrorKind::Client,
            Self::Request(RequestError::Network { .. }) => ErrorKind::Network,
            Self::Request(RequestError::Cancelled { .. }) | Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Request(RequestError::Config(_)) => ErrorKind::Config,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Store(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    RetryExhausted,
    Client,
    Network,
    Decode,
    Storage,
    Cancelled,
    Task,
}

impl ErrorKind {
    /// Whether this failure makes the run exit non-zero.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostError {
    pub host: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostOutcome {
    pub host: String,
    pub pipeline_id: String,
    pub status: HostStatus,
    pub resumed: bool,
    pub pages: usize,
    pub batches: usize,
    /// Records committed by this run.
    pub processed: u64,
    pub counts: UpsertCounts,
    pub retired: u64,
    pub failovers: usize,
    pub malformed: usize,
    pub stats: NormalizeStats,
    /// Cursor of the last committed batch.
    pub last_cursor: Option<PageCursor>,
}

impl HostOutcome {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            pipeline_id: pipeline_id_for_host(host),
            status: HostStatus::Failed,
            resumed: false,
            pages: 0,
            batches: 0,
            processed: 0,
            counts: UpsertCounts::default(),
            retired: 0,
            failovers: 0,
            malformed: 0,
            stats: NormalizeStats::default(),
            last_cursor: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_processed: u64,
    pub last_cursor: BTreeMap<String, PageCursor>,
    pub completed_hosts: Vec<String>,
    pub errors: Vec<HostError>,
    pub hosts: Vec<HostOutcome>,
}

impl IngestResult {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            total_processed: 0,
            last_cursor: BTreeMap::new(),
            completed_hosts: Vec::new(),
            errors: Vec::new(),
            hosts: Vec::new(),
        }
    }

    fn record(&mut self, outcome: HostOutcome, error: Option<HostError>) {
        self.total_processed += outcome.processed;
        if let Some(cursor) = &outcome.last_cursor {
            self.last_cursor.insert(outcome.host.clone(), cursor.clone());
        }
        if outcome.status == HostStatus::Completed {
            self.completed_hosts.push(outcome.host.clone());
        }
        self.errors.extend(error);
        self.hosts.push(outcome);
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// 0 on success, 1 when any host failed for a non-cancellation reason, 130 when
    /// the only failures are cancellations.
    pub fn exit_code(&self) -> i32 {
        if self.errors.iter().any(|e| e.kind.is_fatal()) {
            1
        } else if self.errors.is_empty() {
            0
        } else {
            130
        }
    }
}

/// One host to ingest.
#[derive(Debug, Clone)]
pub struct HostPlan {
    pub settings: SourceSettings,
    pub fetch: FetchOptions,
}

impl HostPlan {
    pub fn host(&self) -> &str {
        &self.settings.host
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub max_concurrent_hosts: usize,
    pub retention: RetentionWindow,
    pub include_stale: bool,
    pub headers: Vec<(String, String)>,
    pub shutdown: ShutdownSignal,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_hosts: DEFAULT_MAX_CONCURRENT_HOSTS,
            retention: RetentionWindow::default(),
            include_stale: false,
            headers: Vec::new(),
            shutdown: ShutdownSignal::never(),
        }
    }
}

/// Per-run collaborators shared by every host task.
#[derive(Clone)]
pub struct IngestContext {
    pub client: Arc<RegionalClient>,
    pub checkpoints: CheckpointManager,
}

impl IngestContext {
    pub fn new(client: Arc<RegionalClient>, checkpoints: CheckpointManager) -> Self {
        Self { client, checkpoints }
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.client.resilience().clock()
    }
}

pub async fn run_ingest(ctx: &IngestContext, hosts: Vec<HostPlan>, options: &IngestOptions) -> IngestResult {
    let mut result = IngestResult::new(ctx.clock().now());
    info!(
        event = "ingest_start",
        run_id = %result.run_id,
        hosts = hosts.len(),
        batch_size = options.batch_size,
        max_concurrent_hosts = options.max_concurrent_hosts,
        since = %options.retention.since,
        until = %options.retention.until,
        include_stale = options.include_stale,
        "ingest starting"
    );

    let limit = Arc::new(Semaphore::new(options.max_concurrent_hosts.max(1)));
    let mut tasks = JoinSet::new();
    for plan in hosts {
        let ctx = ctx.clone();
        let options = options.clone();
        let limit = Arc::clone(&limit);
        let span = tracing::info_span!("host", host = %plan.host());
        tasks.spawn(
            async move {
                let _permit = limit.acquire_owned().await.ok();
                ingest_host(&ctx, plan, &options).await
            }
            .instrument(span),
        );
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((outcome, err)) => result.record(outcome, err),
            Err(join_err) => {
                error!(event = "ingest_error", error = %join_err, "host task aborted");
                result.errors.push(HostError {
                    host: "<unknown>".to_string(),
                    kind: ErrorKind::Task,
                    message: join_err.to_string(),
                });
            }
        }
    }

    result.hosts.sort_by(|a, b| a.host.cmp(&b.host));
    result.completed_hosts.sort();
    result.errors.sort_by(|a, b| a.host.cmp(&b.host));
    result.finished_at = ctx.clock().now();
    info!(
        event = "completion",
        run_id = %result.run_id,
        total_processed = result.total_processed,
        completed = result.completed_hosts.len(),
        failed = result.errors.len(),
        "ingest finished"
    );
    result
}

/// Runs one host to completion and reports how it ended. Never panics on host failure.
async fn ingest_host(ctx: &IngestContext, plan: HostPlan, options: &IngestOptions) -> (HostOutcome, Option<HostError>) {
    let host = plan.host().to_string();
    let mut outcome = HostOutcome::new(&host);
    match drive_host(ctx, &plan, options, &mut outcome).await {
        Ok(()) => {
            outcome.status = HostStatus::Completed;
            (outcome, None)
        }
        Err(err) => {
            let kind = err.kind();
            if kind == ErrorKind::Cancelled {
                outcome.status = HostStatus::Cancelled;
                warn!(event = "ingest_error", host = %host, kind = ?kind, batches = outcome.batches, "host ingest cancelled");
            } else {
                outcome.status = HostStatus::Failed;
                error!(event = "ingest_error", host = %host, kind = ?kind, error = %err, batches = outcome.batches, "host ingest failed");
            }
            let message = err.to_string();
            (outcome, Some(HostError { host, kind, message }))
        }
    }
}

struct HostRun<'a> {
    ctx: &'a IngestContext,
    options: &'a IngestOptions,
    host: &'a str,
    pipeline_id: String,
    token: ResumeToken,
    pending: Vec<RawRecord>,
    pending_cursor: Option<PageCursor>,
    latest: LatestSeen,
}

impl HostRun<'_> {
    /// Normalizes the pending pages and commits them together with the advanced token.
    async fn commit(&mut self, outcome: &mut HostOutcome) -> Result<(), IngestError> {
        let Some(cursor) = self.pending_cursor.take() else {
            return Ok(());
        };
        let raw = std::mem::take(&mut self.pending);
        let mut output = normalize_all(raw, self.host, &self.options.retention, self.options.include_stale);
        self.latest.retain_newer(&mut output);
        let committed = output.normalized.len() as u64;
        let next = self.token.advance(cursor.clone(), committed);

        let counts = self
            .ctx
            .checkpoints
            .commit(&self.pipeline_id, self.host, &next, &output.normalized, self.ctx.clock().now())
            .await?;

        self.token = next;
        outcome.batches += 1;
        outcome.processed += committed;
        outcome.counts += counts;
        outcome.stats += output.stats;
        outcome.last_cursor = Some(cursor.clone());
        info!(
            event = "batch_committed",
            host = self.host,
            batch = outcome.batches,
            records = committed,
            inserted = counts.inserted,
            updated = counts.updated,
            stale_excluded = output.stats.stale_excluded,
            cursor = %cursor.describe(),
            "batch committed"
        );
        Ok(())
    }
}

async fn drive_host(
    ctx: &IngestContext,
    plan: &HostPlan,
    options: &IngestOptions,
    outcome: &mut HostOutcome,
) -> Result<(), IngestError> {
    let host = plan.host();
    let pipeline_id = pipeline_id_for_host(host);
    let source: Box<dyn CatalogSource> = source_for(&plan.settings, options.headers.clone());
    let clock = ctx.clock();

    let stored = ctx.checkpoints.load_token(&pipeline_id).await?;
    let (token, resume_cursor) = match stored {
        Some(token) if !token.completed => {
            outcome.resumed = true;
            info!(
                event = "resume",
                host,
                cursor = %token.cursor.describe(),
                committed_records = token.committed_records,
                sweep_started_at = %token.sweep_started_at,
                "resuming interrupted sweep"
            );
            let cursor = token.cursor.clone();
            (token, Some(cursor))
        }
        _ => (
            ResumeToken::start(store_precision(clock.now()), source.initial_cursor()),
            None,
        ),
    };

    let mut fetcher = PaginatedFetcher::new(&ctx.client, source.as_ref(), plan.fetch, resume_cursor)
        .map_err(|err| IngestError::from_fetch(err, host))?;
    let mut run = HostRun {
        ctx,
        options,
        host,
        pipeline_id,
        token,
        pending: Vec::new(),
        pending_cursor: None,
        latest: LatestSeen::new(),
    };
    let mut last_progress = clock.now();

    loop {
        if options.shutdown.should_stop(clock.now()) {
            return Err(IngestError::Cancelled { host: host.to_string() });
        }
        let Some(page) = fetcher
            .next_page(&options.shutdown)
            .await
            .map_err(|err| IngestError::from_fetch(err, host))?
        else {
            break;
        };

        outcome.pages += 1;
        outcome.malformed += page.malformed;
        if page.failed_over {
            outcome.failovers += 1;
            info!(event = "failover", host, region = %page.region, cursor = %page.cursor.describe(), "page served by alternate region");
        }
        run.pending.extend(page.records);
        run.pending_cursor = Some(page.next_cursor);

        if run.pending.len() >= options.batch_size.max(1) {
            run.commit(outcome).await?;
        }

        let now = clock.now();
        if (now - last_progress).to_std().unwrap_or(Duration::ZERO) >= PROGRESS_INTERVAL {
            last_progress = now;
            info!(
                event = "progress",
                host,
                pages = outcome.pages,
                processed = outcome.processed,
                expected_total = ?fetcher.expected_total(),
                cursor = %fetcher.cursor().describe(),
                "ingest progress"
            );
        }
    }

    run.commit(outcome).await?;
    let stop = fetcher.stop_reason();
    let retire = stop.is_some_and(|reason| reason.covers_catalog());
    if !retire {
        warn!(
            host,
            stop = stop.map(|r| r.as_str()).unwrap_or("none"),
            pages = outcome.pages,
            "sweep stopped at a safety limit, skipping retirement"
        );
    }
    outcome.retired = ctx
        .checkpoints
        .finish(&run.pipeline_id, host, &run.token, clock.now(), retire)
        .await?;
    info!(
        event = "completion",
        host,
        pages = outcome.pages,
        processed = outcome.processed,
        inserted = outcome.counts.inserted,
        updated = outcome.counts.updated,
        retired = outcome.retired,
        stop = stop.map(|r| r.as_str()).unwrap_or("none"),
        "host sweep complete"
    );
    Ok(())
}
