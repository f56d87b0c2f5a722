use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use catmirror_adapters::{FetchOptions, PaginationStyle, SourceKind, SourceSettings};
use catmirror_core::{pipeline_id_for_host, PageCursor, ResumeState, RetentionWindow};
use catmirror_storage::{
    shutdown_channel, BackoffPolicy, CatalogRequest, CheckpointManager, Clock, HttpClientConfig, HttpTransport,
    MemoryMirrorStore, MirrorStore, RegionConfig, RegionalClient, RegionalRouter, ResilienceClient, ResumeToken,
    ShutdownSignal, TransportError, TransportResponse, VirtualClock,
};
use catmirror_sync::{
    run_ingest, ErrorKind, HostPlan, HostStatus, IngestContext, IngestOptions, RunRequest, SourceRegistry,
    SyncConfig, SyncRunner,
};
use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};

enum Behavior {
    Records(Vec<Value>),
    Status(u16),
}

/// In-memory discovery API keyed by the `domains` query parameter.
#[derive(Default)]
struct CatalogServer {
    hosts: Mutex<HashMap<String, Behavior>>,
    requests: AtomicUsize,
}

impl CatalogServer {
    fn serve(&self, host: &str, behavior: Behavior) {
        self.hosts.lock().unwrap().insert(host.to_string(), behavior);
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for CatalogServer {
    async fn send(&self, request: &CatalogRequest) -> Result<TransportResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let host = request.query_value("domains").unwrap_or_default();
        let hosts = self.hosts.lock().unwrap();
        let (status, body) = match hosts.get(host) {
            Some(Behavior::Status(code)) => (*code, Vec::new()),
            Some(Behavior::Records(records)) => {
                let offset: usize = request.query_value("offset").unwrap_or("0").parse().unwrap();
                let limit: usize = request.query_value("limit").unwrap_or("1000").parse().unwrap();
                let page: Vec<Value> = records.iter().skip(offset).take(limit).cloned().collect();
                (200, serde_json::to_vec(&json!({ "results": page })).unwrap())
            }
            None => (404, Vec::new()),
        };
        Ok(TransportResponse {
            status,
            retry_after: None,
            final_url: request.display_url(),
            body,
        })
    }
}

fn dataset(id: &str, updated: &str) -> Value {
    json!({ "resource": { "id": id, "name": format!("Dataset {id}"), "updatedAt": updated } })
}

fn datasets(ids: &[&str]) -> Vec<Value> {
    ids.iter().map(|id| dataset(id, "2025-06-01T00:00:00Z")).collect()
}

struct Harness {
    server: Arc<CatalogServer>,
    clock: Arc<VirtualClock>,
    store: Arc<MemoryMirrorStore>,
    ctx: IngestContext,
}

fn harness() -> Harness {
    let server = Arc::new(CatalogServer::default());
    let clock = Arc::new(VirtualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
    ));
    let store = Arc::new(MemoryMirrorStore::new());
    let config = HttpClientConfig {
        backoff: BackoffPolicy {
            max_retries: 2,
            ..BackoffPolicy::default()
        },
        ..HttpClientConfig::default()
    };
    let resilience = ResilienceClient::new(server.clone(), clock.clone(), &config).with_jitter_seed(11);
    let router = RegionalRouter::new(RegionConfig::default()).unwrap();
    let ctx = IngestContext::new(
        Arc::new(RegionalClient::new(Arc::new(resilience), Arc::new(router))),
        CheckpointManager::new(store.clone()),
    );
    Harness {
        server,
        clock,
        store,
        ctx,
    }
}

fn plan(host: &str) -> HostPlan {
    HostPlan {
        settings: SourceSettings {
            host: host.to_string(),
            kind: SourceKind::Socrata,
            pagination: PaginationStyle::Offset,
            json: None,
        },
        fetch: FetchOptions {
            page_size: 2,
            ..FetchOptions::default()
        },
    }
}

fn options() -> IngestOptions {
    IngestOptions {
        batch_size: 2,
        retention: RetentionWindow::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
        )
        .unwrap(),
        ..IngestOptions::default()
    }
}

async fn active_ids(store: &MemoryMirrorStore, host: &str) -> Vec<String> {
    let mut ids: Vec<_> = store
        .rows(host)
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.active)
        .map(|row| row.record.id)
        .collect();
    ids.sort();
    ids
}

const HOST: &str = "data.city.gov";

#[tokio::test]
async fn rerunning_a_completed_sweep_inserts_nothing() {
    let h = harness();
    h.server.serve(HOST, Behavior::Records(datasets(&["r1", "r2", "r3", "r4", "r5"])));

    let first = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    assert_eq!(first.exit_code(), 0);
    assert_eq!(first.completed_hosts, vec![HOST.to_string()]);
    assert_eq!(first.total_processed, 5);
    assert_eq!(first.hosts[0].counts.inserted, 5);
    assert_eq!(first.hosts[0].batches, 3);
    assert_eq!(first.last_cursor.get(HOST), Some(&PageCursor::Offset { offset: 6 }));

    h.clock.advance(Duration::from_secs(3600));
    let second = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    let outcome = &second.hosts[0];
    assert!(!outcome.resumed);
    assert_eq!(outcome.counts.inserted, 0);
    assert_eq!(outcome.counts.updated, 5);
    assert_eq!(outcome.retired, 0);
    assert_eq!(active_ids(&h.store, HOST).await.len(), 5);
}

#[tokio::test]
async fn an_interrupted_sweep_resumes_after_the_last_committed_batch() {
    let h = harness();
    h.server.serve(HOST, Behavior::Records(datasets(&["r1", "r2", "r3", "r4", "r5"])));
    h.store.fail_commits_after(1);

    let broken = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    assert_eq!(broken.errors.len(), 1);
    assert_eq!(broken.errors[0].kind, ErrorKind::Storage);
    assert_eq!(broken.exit_code(), 1);
    assert_eq!(active_ids(&h.store, HOST).await, vec!["r1", "r2"]);

    let stored = h
        .store
        .load_checkpoint(&pipeline_id_for_host(HOST))
        .await
        .unwrap()
        .unwrap();
    let token = ResumeToken::decode(&stored.pipeline_id, &stored.resume_token).unwrap();
    assert!(!token.completed);
    assert_eq!(token.cursor, PageCursor::Offset { offset: 2 });

    h.store.clear_faults();
    h.clock.advance(Duration::from_secs(60));
    let resumed = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    let outcome = &resumed.hosts[0];
    assert_eq!(resumed.exit_code(), 0);
    assert!(outcome.resumed);
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.counts.inserted, 3);
    // Rows from before the interruption belong to the same sweep and stay active.
    assert_eq!(outcome.retired, 0);
    assert_eq!(active_ids(&h.store, HOST).await, vec!["r1", "r2", "r3", "r4", "r5"]);
}

#[tokio::test]
async fn rows_missing_from_a_completed_sweep_are_retired() {
    let h = harness();
    h.server.serve(HOST, Behavior::Records(datasets(&["r1", "r2", "r3"])));
    run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;

    h.server.serve(HOST, Behavior::Records(datasets(&["r1", "r3"])));
    h.clock.advance(Duration::from_secs(3600));
    let result = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;

    assert_eq!(result.hosts[0].retired, 1);
    assert_eq!(active_ids(&h.store, HOST).await, vec!["r1", "r3"]);
    let rows = h.store.rows(HOST).await.unwrap();
    assert_eq!(rows.len(), 3, "retirement never deletes");
}

#[tokio::test]
async fn a_fresher_copy_on_a_later_page_replaces_the_committed_one() {
    let h = harness();
    h.server.serve(
        HOST,
        Behavior::Records(vec![
            dataset("a", "2025-01-01"),
            dataset("b", "2025-06-01"),
            dataset("a", "2025-02-01"),
        ]),
    );

    let result = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.hosts[0].processed, 3);
    let rows = h.store.rows(HOST).await.unwrap();
    let a = rows.iter().find(|row| row.record.id == "a").unwrap();
    assert_eq!(a.record.updated_at.as_deref(), Some("2025-02-01"));
}

#[tokio::test]
async fn an_older_copy_on_a_later_page_is_skipped() {
    let h = harness();
    h.server.serve(
        HOST,
        Behavior::Records(vec![
            dataset("a", "2025-02-01"),
            dataset("b", "2025-06-01"),
            dataset("a", "2025-01-01"),
        ]),
    );

    let result = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    let outcome = &result.hosts[0];
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.stats.duplicates_collapsed, 1);
    let rows = h.store.rows(HOST).await.unwrap();
    let a = rows.iter().find(|row| row.record.id == "a").unwrap();
    assert_eq!(a.record.updated_at.as_deref(), Some("2025-02-01"));
}

#[tokio::test]
async fn a_sweep_cut_short_by_the_offset_ceiling_retires_nothing() {
    let h = harness();
    let all = ["r0", "r1", "r2", "r3", "r4", "r5"];
    h.server.serve(HOST, Behavior::Records(datasets(&all)));
    run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    assert_eq!(active_ids(&h.store, HOST).await.len(), 6);

    h.clock.advance(Duration::from_secs(3600));
    let mut capped = plan(HOST);
    capped.fetch.max_offset = 2;
    let result = run_ingest(&h.ctx, vec![capped], &options()).await;

    assert_eq!(result.completed_hosts, vec![HOST.to_string()]);
    assert_eq!(result.hosts[0].pages, 2);
    assert_eq!(result.hosts[0].retired, 0);
    assert_eq!(active_ids(&h.store, HOST).await, all.to_vec());

    let stored = h
        .store
        .load_checkpoint(&pipeline_id_for_host(HOST))
        .await
        .unwrap()
        .unwrap();
    let token = ResumeToken::decode(&stored.pipeline_id, &stored.resume_token).unwrap();
    assert!(token.completed, "the next run starts a fresh sweep");
}

#[tokio::test]
async fn one_failing_host_does_not_stop_the_others() {
    let h = harness();
    h.server.serve("good.gov", Behavior::Records(datasets(&["g1", "g2", "g3"])));
    h.server.serve("down.gov", Behavior::Status(500));
    h.server.serve("locked.gov", Behavior::Status(401));

    let result = run_ingest(
        &h.ctx,
        vec![plan("down.gov"), plan("good.gov"), plan("locked.gov")],
        &options(),
    )
    .await;

    assert_eq!(result.completed_hosts, vec!["good.gov".to_string()]);
    assert_eq!(result.exit_code(), 1);
    let kinds: Vec<_> = result.errors.iter().map(|e| (e.host.as_str(), e.kind)).collect();
    assert_eq!(
        kinds,
        vec![("down.gov", ErrorKind::RetryExhausted), ("locked.gov", ErrorKind::Client)]
    );
    assert_eq!(active_ids(&h.store, "good.gov").await, vec!["g1", "g2", "g3"]);
    assert!(h.store.load_checkpoint(&pipeline_id_for_host("down.gov")).await.unwrap().is_none());
    // good: 2 pages; down: 3 attempts per region, two regions; locked: one request.
    assert_eq!(h.server.requests(), 2 + 6 + 1);
}

#[tokio::test]
async fn cancelled_runs_commit_nothing() {
    let h = harness();
    h.server.serve(HOST, Behavior::Records(datasets(&["r1", "r2", "r3"])));
    let (trigger, signal) = shutdown_channel();
    trigger.trigger();

    let result = run_ingest(
        &h.ctx,
        vec![plan(HOST)],
        &IngestOptions {
            shutdown: signal,
            ..options()
        },
    )
    .await;

    assert_eq!(result.hosts[0].status, HostStatus::Cancelled);
    assert_eq!(result.errors[0].kind, ErrorKind::Cancelled);
    assert_eq!(result.exit_code(), 130);
    assert_eq!(h.store.commit_count(), 0);
}

#[tokio::test]
async fn a_malformed_stored_token_is_a_config_error() {
    let h = harness();
    h.server.serve(HOST, Behavior::Records(datasets(&["r1"])));
    h.store.put_checkpoint(ResumeState {
        pipeline_id: pipeline_id_for_host(HOST),
        resume_token: "offset=400".into(),
        last_processed_at: h.clock.now(),
    });

    let result = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    assert_eq!(result.errors[0].kind, ErrorKind::Config);
    assert_eq!(result.exit_code(), 1);
    assert_eq!(h.server.requests(), 0);
}

#[tokio::test]
async fn stale_records_are_excluded_unless_requested() {
    let h = harness();
    h.server.serve(
        HOST,
        Behavior::Records(vec![
            dataset("fresh", "2025-12-01"),
            dataset("stale", "2020-01-01"),
            json!({ "resource": { "id": "undated", "name": "Undated" } }),
        ]),
    );

    let strict = run_ingest(&h.ctx, vec![plan(HOST)], &options()).await;
    assert_eq!(strict.hosts[0].stats.stale_excluded, 1);
    assert_eq!(active_ids(&h.store, HOST).await, vec!["fresh", "undated"]);

    h.clock.advance(Duration::from_secs(3600));
    let lenient = run_ingest(
        &h.ctx,
        vec![plan(HOST)],
        &IngestOptions {
            include_stale: true,
            ..options()
        },
    )
    .await;
    assert_eq!(lenient.hosts[0].stats.stale_excluded, 0);
    assert_eq!(active_ids(&h.store, HOST).await, vec!["fresh", "stale", "undated"]);
}

#[tokio::test]
async fn runner_writes_reports_and_lists_sources() {
    let h = harness();
    h.server.serve(HOST, Behavior::Records(datasets(&["r1", "r2"])));
    let reports = tempfile::tempdir().unwrap();
    let reports_path = reports.path().display().to_string();
    let config = SyncConfig::from_lookup(
        |key| match key {
            "CATMIRROR_REPORTS_DIR" => Some(reports_path.clone()),
            "CATMIRROR_BATCH_SIZE" => Some("10".to_string()),
            _ => None,
        },
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
    )
    .unwrap();
    let registry = SourceRegistry::from_yaml(&format!(
        "sources:\n  - {{key: city, display_name: City, host: {HOST}, page_size: 5}}\n  - {{key: paris, display_name: Paris, host: opendata.paris.fr, region: eu, enabled: false}}\n"
    ))
    .unwrap();
    let runner = SyncRunner::new(config, registry, h.store.clone())
        .with_transport(h.server.clone(), h.clock.clone());

    let listing = runner.source_listing().unwrap();
    assert_eq!(listing[1].region, "eu");
    assert_eq!(listing[1].base_url, "https://api.eu.socrata.com");

    let result = runner.run_once(&RunRequest::default(), ShutdownSignal::never()).await.unwrap();
    assert_eq!(result.completed_hosts, vec![HOST.to_string()]);

    let run_dir = reports.path().join(result.run_id.to_string());
    let summary: Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("ingest_summary.json")).unwrap()).unwrap();
    assert_eq!(summary["total_processed"], 2);
    assert!(std::fs::read_to_string(run_dir.join("brief.md")).unwrap().contains(HOST));

    let status = runner.checkpoint_status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].completed, Some(true));
}
