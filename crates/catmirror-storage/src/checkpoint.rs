//! Resume tokens and the transactional checkpoint manager.
//!
//! A resume token is a versioned, checksummed value rather than a raw offset:
//! `v1.<hex(json)>.<sha256 prefix>`. It carries the pagination cursor plus the
//! start time of the sweep it belongs to, which is the retirement cutoff once the
//! sweep completes.

use std::sync::Arc;

use catmirror_core::{ConfigError, NormalizedRecord, PageCursor, ResumeState, UpsertCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::registry::{MirrorStore, StoreError};

pub const RESUME_TOKEN_VERSION: u32 = 1;
const CHECKSUM_HEX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub v: u32,
    pub sweep_started_at: DateTime<Utc>,
    pub cursor: PageCursor,
    #[serde(default)]
    pub committed_records: u64,
    #[serde(default)]
    pub completed: bool,
}

impl ResumeToken {
    pub fn start(sweep_started_at: DateTime<Utc>, cursor: PageCursor) -> Self {
        Self {
            v: RESUME_TOKEN_VERSION,
            sweep_started_at,
            cursor,
            committed_records: 0,
            completed: false,
        }
    }

    pub fn advance(&self, cursor: PageCursor, committed: u64) -> Self {
        Self {
            cursor,
            committed_records: self.committed_records + committed,
            ..self.clone()
        }
    }

    pub fn completed(&self) -> Self {
        Self {
            completed: true,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a plain struct of strings/integers cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("v{}.{}.{}", self.v, hex::encode(&json), checksum(&json))
    }

    pub fn decode(pipeline_id: &str, raw: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedResumeToken {
            pipeline_id: pipeline_id.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = raw.trim().splitn(3, '.');
        let (Some(prefix), Some(payload), Some(sum)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("expected three dot-separated parts"));
        };
        if prefix != format!("v{RESUME_TOKEN_VERSION}") {
            return Err(malformed(&format!("unsupported version prefix '{prefix}'")));
        }
        let json = hex::decode(payload).map_err(|_| malformed("payload is not hex"))?;
        if checksum(&json) != sum {
            return Err(malformed("checksum mismatch"));
        }
        let token: ResumeToken =
            serde_json::from_slice(&json).map_err(|err| malformed(&format!("payload: {err}")))?;
        if token.v != RESUME_TOKEN_VERSION {
            return Err(malformed(&format!("payload version {}", token.v)));
        }
        Ok(token)
    }
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CHECKSUM_HEX_LEN);
    digest
}

/// Truncates to the microsecond precision the store keeps, so timestamps compare exactly.
pub fn store_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Couples resume-token advancement with the registry writes it describes.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn MirrorStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn MirrorStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MirrorStore> {
        &self.store
    }

    pub async fn load(&self, pipeline_id: &str) -> Result<Option<ResumeState>, StoreError> {
        self.store.load_checkpoint(pipeline_id).await
    }

    /// Loads and validates the stored token. A token that does not decode is an error,
    /// never a silent restart from zero.
    pub async fn load_token(&self, pipeline_id: &str) -> Result<Option<ResumeToken>, CheckpointError> {
        let Some(state) = self.load(pipeline_id).await? else {
            return Ok(None);
        };
        Ok(Some(ResumeToken::decode(pipeline_id, &state.resume_token)?))
    }

    /// Upserts the batch and advances the token in one transaction.
    pub async fn commit(
        &self,
        pipeline_id: &str,
        host: &str,
        token: &ResumeToken,
        batch: &[NormalizedRecord],
        timestamp: DateTime<Utc>,
    ) -> Result<UpsertCounts, StoreError> {
        let state = ResumeState {
            pipeline_id: pipeline_id.to_string(),
            resume_token: token.encode(),
            last_processed_at: store_precision(timestamp),
        };
        self.store.commit_batch(host, batch, &state).await
    }

    /// Marks the token completed and, when `retire` is set, retires rows the sweep
    /// never saw, in one transaction. Returns the number of retired rows.
    pub async fn finish(
        &self,
        pipeline_id: &str,
        host: &str,
        token: &ResumeToken,
        timestamp: DateTime<Utc>,
        retire: bool,
    ) -> Result<u64, StoreError> {
        let state = ResumeState {
            pipeline_id: pipeline_id.to_string(),
            resume_token: token.completed().encode(),
            last_processed_at: store_precision(timestamp),
        };
        self.store
            .finish_sweep(host, retire.then(|| store_precision(token.sweep_started_at)), &state)
            .await
    }
}
