//! Registry mirror store: idempotent upserts keyed by `(host, id)`, soft retirement,
//! and checkpoint rows written in the same transaction as the data they describe.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use catmirror_core::{
    NormalizedRecord, RegistryRow, ResumeState, RetentionDescriptor, RetentionField, UpsertCounts,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;

/// Rows per multi-row INSERT; keeps bind parameters far below the Postgres limit.
const UPSERT_CHUNK: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt registry row {host}/{id}: {reason}")]
    Corrupt {
        host: String,
        id: String,
        reason: String,
    },
}

#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Inserts or refreshes records; `last_seen` becomes `seen_at`, `first_seen` is kept.
    async fn upsert(
        &self,
        host: &str,
        records: &[NormalizedRecord],
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertCounts, StoreError>;

    /// Flips active rows with `last_seen < cutoff` to inactive. Never deletes.
    async fn retire(&self, host: &str, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn load_checkpoint(&self, pipeline_id: &str) -> Result<Option<ResumeState>, StoreError>;

    /// Upsert with `seen_at = state.last_processed_at` and checkpoint write, atomically.
    async fn commit_batch(
        &self,
        host: &str,
        records: &[NormalizedRecord],
        state: &ResumeState,
    ) -> Result<UpsertCounts, StoreError>;

    /// Retirement and checkpoint write, atomically. `None` writes the checkpoint only.
    async fn finish_sweep(
        &self,
        host: &str,
        cutoff: Option<DateTime<Utc>>,
        state: &ResumeState,
    ) -> Result<u64, StoreError>;

    async fn rows(&self, host: &str) -> Result<Vec<RegistryRow>, StoreError>;

    async fn checkpoints(&self) -> Result<Vec<ResumeState>, StoreError>;
}

/// Keeps the last occurrence of each id so one statement never touches a key twice.
fn collapse_by_id(records: &[NormalizedRecord]) -> Vec<&NormalizedRecord> {
    let mut by_id: BTreeMap<&str, &NormalizedRecord> = BTreeMap::new();
    for record in records {
        by_id.insert(record.id.as_str(), record);
    }
    by_id.into_values().collect()
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<(String, String), RegistryRow>,
    checkpoints: BTreeMap<String, ResumeState>,
    commits: usize,
}

impl MemoryState {
    fn upsert(
        &mut self,
        host: &str,
        records: &[NormalizedRecord],
        seen_at: DateTime<Utc>,
    ) -> UpsertCounts {
        let mut counts = UpsertCounts::default();
        for record in collapse_by_id(records) {
            let key = (host.to_string(), record.id.clone());
            let row = self.rows.entry(key).or_insert_with(|| RegistryRow {
                record: record.clone(),
                first_seen: seen_at,
                last_seen: seen_at,
                active: true,
            });
            row.record = NormalizedRecord {
                host: host.to_string(),
                ..record.clone()
            };
            row.last_seen = row.last_seen.max(seen_at);
            row.active = true;
            if row.first_seen == seen_at {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }
        counts
    }

    fn retire(&mut self, host: &str, cutoff: DateTime<Utc>) -> u64 {
        let mut retired = 0;
        for ((row_host, _), row) in self.rows.iter_mut() {
            if row_host == host && row.active && row.last_seen < cutoff {
                row.active = false;
                retired += 1;
            }
        }
        retired
    }
}

/// In-process store with the same semantics as Postgres. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryMirrorStore {
    state: Mutex<MemoryState>,
    fail_commit_after: Mutex<Option<usize>>,
}

impl MemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// After `n` more successful batch commits, every commit fails without applying.
    pub fn fail_commits_after(&self, n: usize) {
        let commits = self.lock().commits;
        *self
            .fail_commit_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(commits + n);
    }

    pub fn clear_faults(&self) {
        *self
            .fail_commit_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn put_checkpoint(&self, state: ResumeState) {
        self.lock()
            .checkpoints
            .insert(state.pipeline_id.clone(), state);
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fault(&self, state: &MemoryState) -> Result<(), StoreError> {
        let limit = *self
            .fail_commit_after
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match limit {
            Some(limit) if state.commits >= limit => Err(StoreError::Unavailable(
                "injected commit failure".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    async fn upsert(
        &self,
        host: &str,
        records: &[NormalizedRecord],
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertCounts, StoreError> {
        Ok(self.lock().upsert(host, records, seen_at))
    }

    async fn retire(&self, host: &str, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.lock().retire(host, cutoff))
    }

    async fn load_checkpoint(&self, pipeline_id: &str) -> Result<Option<ResumeState>, StoreError> {
        Ok(self.lock().checkpoints.get(pipeline_id).cloned())
    }

    async fn commit_batch(
        &self,
        host: &str,
        records: &[NormalizedRecord],
        state: &ResumeState,
    ) -> Result<UpsertCounts, StoreError> {
        let mut guard = self.lock();
        self.check_fault(&guard)?;
        let counts = guard.upsert(host, records, state.last_processed_at);
        guard
            .checkpoints
            .insert(state.pipeline_id.clone(), state.clone());
        guard.commits += 1;
        Ok(counts)
    }

    async fn finish_sweep(
        &self,
        host: &str,
        cutoff: Option<DateTime<Utc>>,
        state: &ResumeState,
    ) -> Result<u64, StoreError> {
        let mut guard = self.lock();
        self.check_fault(&guard)?;
        let retired = cutoff.map_or(0, |cutoff| guard.retire(host, cutoff));
        guard
            .checkpoints
            .insert(state.pipeline_id.clone(), state.clone());
        guard.commits += 1;
        Ok(retired)
    }

    async fn rows(&self, host: &str) -> Result<Vec<RegistryRow>, StoreError> {
        Ok(self
            .lock()
            .rows
            .iter()
            .filter(|((row_host, _), _)| row_host == host)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn checkpoints(&self) -> Result<Vec<ResumeState>, StoreError> {
        Ok(self.lock().checkpoints.values().cloned().collect())
    }
}

/// Postgres-backed mirror.
#[derive(Debug, Clone)]
pub struct PgMirrorStore {
    pool: PgPool,
}

impl PgMirrorStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

async fn upsert_in(
    conn: &mut PgConnection,
    host: &str,
    records: &[NormalizedRecord],
    seen_at: DateTime<Utc>,
) -> Result<UpsertCounts, StoreError> {
    let mut counts = UpsertCounts::default();
    let records = collapse_by_id(records);

    for chunk in records.chunks(UPSERT_CHUNK) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO catalog_registry \
                (host, id, name, kind, permalink, created_at, updated_at, tags, categories, \
                 owner, license, retention_field, retention_since, retention_until, \
                 first_seen, last_seen, active) ",
        );
        builder.push_values(chunk.iter().copied(), |mut row, record| {
            row.push_bind(host)
                .push_bind(record.id.as_str())
                .push_bind(record.name.as_deref())
                .push_bind(record.kind.as_deref())
                .push_bind(record.permalink.as_deref())
                .push_bind(record.created_at.as_deref())
                .push_bind(record.updated_at.as_deref())
                .push_bind(record.tags.clone())
                .push_bind(record.categories.clone())
                .push_bind(record.owner.as_deref())
                .push_bind(record.license.as_deref())
                .push_bind(record.retention.field.as_str())
                .push_bind(record.retention.since)
                .push_bind(record.retention.until)
                .push_bind(seen_at)
                .push_bind(seen_at)
                .push_bind(true);
        });
        builder.push(
            " ON CONFLICT (host, id) DO UPDATE SET \
                name = EXCLUDED.name, \
                kind = EXCLUDED.kind, \
                permalink = EXCLUDED.permalink, \
                created_at = EXCLUDED.created_at, \
                updated_at = EXCLUDED.updated_at, \
                tags = EXCLUDED.tags, \
                categories = EXCLUDED.categories, \
                owner = EXCLUDED.owner, \
                license = EXCLUDED.license, \
                retention_field = EXCLUDED.retention_field, \
                retention_since = EXCLUDED.retention_since, \
                retention_until = EXCLUDED.retention_until, \
                last_seen = GREATEST(catalog_registry.last_seen, EXCLUDED.last_seen), \
                active = TRUE \
             RETURNING first_seen",
        );

        let rows = builder.build().fetch_all(&mut *conn).await?;
        for row in rows {
            let first_seen: DateTime<Utc> = row.try_get("first_seen")?;
            if first_seen == seen_at {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }
    }

    Ok(counts)
}

async fn retire_in(
    conn: &mut PgConnection,
    host: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE catalog_registry SET active = FALSE \
         WHERE host = $1 AND active AND last_seen < $2",
    )
    .bind(host)
    .bind(cutoff)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn save_checkpoint_in(conn: &mut PgConnection, state: &ResumeState) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO ingest_checkpoints (pipeline_id, resume_token, last_processed_at) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (pipeline_id) DO UPDATE SET \
            resume_token = EXCLUDED.resume_token, \
            last_processed_at = EXCLUDED.last_processed_at",
    )
    .bind(&state.pipeline_id)
    .bind(&state.resume_token)
    .bind(state.last_processed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_state(row: &PgRow) -> Result<ResumeState, StoreError> {
    Ok(ResumeState {
        pipeline_id: row.try_get("pipeline_id")?,
        resume_token: row.try_get("resume_token")?,
        last_processed_at: row.try_get("last_processed_at")?,
    })
}

fn row_to_registry(row: &PgRow) -> Result<RegistryRow, StoreError> {
    let host: String = row.try_get("host")?;
    let id: String = row.try_get("id")?;
    let field_raw: String = row.try_get("retention_field")?;
    let field = RetentionField::parse(&field_raw).ok_or_else(|| StoreError::Corrupt {
        host: host.clone(),
        id: id.clone(),
        reason: format!("unknown retention field '{field_raw}'"),
    })?;
    let since: NaiveDate = row.try_get("retention_since")?;
    let until: NaiveDate = row.try_get("retention_until")?;

    Ok(RegistryRow {
        record: NormalizedRecord {
            id,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            host,
            permalink: row.try_get("permalink")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            tags: row.try_get("tags")?,
            categories: row.try_get("categories")?,
            owner: row.try_get("owner")?,
            license: row.try_get("license")?,
            retention: RetentionDescriptor {
                field,
                since,
                until,
            },
        },
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        active: row.try_get("active")?,
    })
}

#[async_trait]
impl MirrorStore for PgMirrorStore {
    async fn upsert(
        &self,
        host: &str,
        records: &[NormalizedRecord],
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let counts = upsert_in(&mut tx, host, records, seen_at).await?;
        tx.commit().await?;
        Ok(counts)
    }

    async fn retire(&self, host: &str, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        retire_in(&mut conn, host, cutoff).await
    }

    async fn load_checkpoint(&self, pipeline_id: &str) -> Result<Option<ResumeState>, StoreError> {
        let row = sqlx::query(
            "SELECT pipeline_id, resume_token, last_processed_at \
             FROM ingest_checkpoints WHERE pipeline_id = $1",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_state).transpose()
    }

    async fn commit_batch(
        &self,
        host: &str,
        records: &[NormalizedRecord],
        state: &ResumeState,
    ) -> Result<UpsertCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let counts = upsert_in(&mut tx, host, records, state.last_processed_at).await?;
        save_checkpoint_in(&mut tx, state).await?;
        tx.commit().await?;
        debug!(host, pipeline_id = %state.pipeline_id, inserted = counts.inserted, updated = counts.updated, "batch committed");
        Ok(counts)
    }

    async fn finish_sweep(
        &self,
        host: &str,
        cutoff: Option<DateTime<Utc>>,
        state: &ResumeState,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let retired = match cutoff {
            Some(cutoff) => retire_in(&mut tx, host, cutoff).await?,
            None => 0,
        };
        save_checkpoint_in(&mut tx, state).await?;
        tx.commit().await?;
        Ok(retired)
    }

    async fn rows(&self, host: &str) -> Result<Vec<RegistryRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT host, id, name, kind, permalink, created_at, updated_at, tags, categories, \
                    owner, license, retention_field, retention_since, retention_until, \
                    first_seen, last_seen, active \
             FROM catalog_registry WHERE host = $1 ORDER BY id",
        )
        .bind(host)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_registry).collect()
    }

    async fn checkpoints(&self) -> Result<Vec<ResumeState>, StoreError> {
        let rows = sqlx::query(
            "SELECT pipeline_id, resume_token, last_processed_at \
             FROM ingest_checkpoints ORDER BY pipeline_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_state).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, h, 0, 0).single().unwrap()
    }

    fn record(id: &str, name: &str) -> NormalizedRecord {
        let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        NormalizedRecord {
            id: id.into(),
            name: Some(name.into()),
            kind: Some("dataset".into()),
            host: "data.city.gov".into(),
            permalink: None,
            created_at: None,
            updated_at: Some("2025-06-01".into()),
            tags: vec!["parks".into()],
            categories: vec![],
            owner: None,
            license: None,
            retention: RetentionDescriptor {
                field: RetentionField::UpdatedAt,
                since: day,
                until: day,
            },
        }
    }

    fn checkpoint(token: &str, at: DateTime<Utc>) -> ResumeState {
        ResumeState {
            pipeline_id: "catalog:data.city.gov".into(),
            resume_token: token.into(),
            last_processed_at: at,
        }
    }

    #[tokio::test]
    async fn second_identical_upsert_inserts_nothing() {
        let store = MemoryMirrorStore::new();
        let batch = vec![record("a", "Alpha"), record("b", "Beta")];

        let first = store.upsert("data.city.gov", &batch, t(1)).await.unwrap();
        let before = store.rows("data.city.gov").await.unwrap();
        let second = store.upsert("data.city.gov", &batch, t(2)).await.unwrap();
        let after = store.rows("data.city.gov").await.unwrap();

        assert_eq!(first, UpsertCounts { inserted: 2, updated: 0 });
        assert_eq!(second, UpsertCounts { inserted: 0, updated: 2 });
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.record, a.record);
            assert_eq!(b.first_seen, a.first_seen);
            assert!(a.first_seen <= a.last_seen);
            assert_eq!(a.last_seen, t(2));
        }
    }

    #[tokio::test]
    async fn retire_soft_deletes_unseen_rows_only() {
        let store = MemoryMirrorStore::new();
        store
            .upsert("data.city.gov", &[record("a", "Alpha"), record("b", "Beta")], t(1))
            .await
            .unwrap();
        store
            .upsert("other.gov", &[record("z", "Zeta")], t(1))
            .await
            .unwrap();
        store
            .upsert("data.city.gov", &[record("a", "Alpha")], t(3))
            .await
            .unwrap();

        let retired = store.retire("data.city.gov", t(2)).await.unwrap();
        assert_eq!(retired, 1);
        assert_eq!(store.retire("data.city.gov", t(2)).await.unwrap(), 0);

        let rows = store.rows("data.city.gov").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().find(|r| r.record.id == "a").unwrap().active);
        assert!(!rows.iter().find(|r| r.record.id == "b").unwrap().active);
        assert!(store.rows("other.gov").await.unwrap()[0].active);

        store
            .upsert("data.city.gov", &[record("b", "Beta")], t(4))
            .await
            .unwrap();
        let rows = store.rows("data.city.gov").await.unwrap();
        assert!(rows.iter().all(|r| r.active));
    }

    #[tokio::test]
    async fn failed_commit_applies_neither_rows_nor_checkpoint() {
        let store = MemoryMirrorStore::new();
        store
            .commit_batch("data.city.gov", &[record("a", "Alpha")], &checkpoint("t1", t(1)))
            .await
            .unwrap();
        store.fail_commits_after(0);

        let err = store
            .commit_batch("data.city.gov", &[record("b", "Beta")], &checkpoint("t2", t(2)))
            .await;
        assert!(matches!(err, Err(StoreError::Unavailable(_))));

        let rows = store.rows("data.city.gov").await.unwrap();
        assert_eq!(rows.len(), 1);
        let saved = store
            .load_checkpoint("catalog:data.city.gov")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.resume_token, "t1");
    }

    #[test]
    fn duplicate_ids_in_one_batch_collapse_to_the_last() {
        let batch = vec![record("a", "First"), record("a", "Second")];
        let collapsed = collapse_by_id(&batch);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].name.as_deref(), Some("Second"));
    }

    /// Runs only when `DATABASE_URL` points at a disposable Postgres.
    #[tokio::test]
    async fn postgres_upsert_roundtrip_when_database_available() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let Ok(store) = PgMirrorStore::connect(&url).await else {
            return;
        };
        store.migrate().await.expect("migrations");
        let host = format!("test-{}.example", Utc::now().timestamp_micros());

        let first = store.upsert(&host, &[record("a", "Alpha")], t(1)).await.unwrap();
        let second = store.upsert(&host, &[record("a", "Alpha")], t(2)).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(second, UpsertCounts { inserted: 0, updated: 1 });
        assert_eq!(store.retire(&host, t(3)).await.unwrap(), 1);
        let rows = store.rows(&host).await.unwrap();
        assert!(!rows[0].active);
        assert_eq!(rows[0].first_seen, t(1));
    }
}
