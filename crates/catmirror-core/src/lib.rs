//! Core catalog model: raw page records, the normalized mirror shape, and resume state.

use std::ops::AddAssign;

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "catmirror-core";

/// Default length of the trailing retention window.
pub const DEFAULT_RETENTION_MONTHS: u32 = 24;

/// Configuration problems. Surfaced immediately and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid retention window: since {since} is after until {until}")]
    InvalidRetentionWindow { since: NaiveDate, until: NaiveDate },
    #[error("invalid date '{0}' (expected YYYY-MM-DD)")]
    InvalidDate(String),
    #[error("unknown region '{region}' referenced by {referenced_by}")]
    UnknownRegion {
        region: String,
        referenced_by: String,
    },
    #[error("malformed resume token for {pipeline_id}: {reason}")]
    MalformedResumeToken { pipeline_id: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

/// Inclusive calendar-date range used for stale filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionWindow {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl RetentionWindow {
    pub fn new(since: NaiveDate, until: NaiveDate) -> Result<Self, ConfigError> {
        if since > until {
            return Err(ConfigError::InvalidRetentionWindow { since, until });
        }
        Ok(Self { since, until })
    }

    /// Window of `months` ending on `today`.
    pub fn trailing_months(today: NaiveDate, months: u32) -> Self {
        let since = today
            .checked_sub_months(Months::new(months))
            .unwrap_or(NaiveDate::MIN);
        Self { since, until: today }
    }

    pub fn default_for(today: NaiveDate) -> Self {
        Self::trailing_months(today, DEFAULT_RETENTION_MONTHS)
    }

    /// Builds a window from optional `YYYY-MM-DD` bounds, defaulting missing ones
    /// to the trailing window ending `today`.
    pub fn parse(
        since: Option<&str>,
        until: Option<&str>,
        today: NaiveDate,
    ) -> Result<Self, ConfigError> {
        let until = match until {
            Some(raw) => parse_date_arg(raw)?,
            None => today,
        };
        let since = match since {
            Some(raw) => parse_date_arg(raw)?,
            None => Self::default_for(until).since,
        };
        Self::new(since, until)
    }

    /// Day-granular stale test against the lower bound.
    pub fn is_stale(&self, freshness: NaiveDate) -> bool {
        freshness < self.since
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self::default_for(Utc::now().date_naive())
    }
}

fn parse_date_arg(raw: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDate(raw.to_string()))
}

/// Stable pipeline identity for one catalog host.
pub fn pipeline_id_for_host(host: &str) -> String {
    format!("catalog:{}", host.trim().to_ascii_lowercase())
}

/// One catalog entry as returned by a source page.
///
/// Every field is optional and scalar fields are read leniently, so a record with
/// unexpected types still deserializes; the normalizer decides what is usable.
/// Both flat records and discovery-style records (`resource`/`classification`/
/// `metadata` envelopes) are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    #[serde(rename = "updatedAt", alias = "updated_at", deserialize_with = "lenient_string")]
    pub updated_at: Option<String>,
    #[serde(
        rename = "indexUpdatedAt",
        alias = "index_updated_at",
        deserialize_with = "lenient_string"
    )]
    pub index_updated_at: Option<String>,
    #[serde(rename = "createdAt", alias = "created_at", deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub permalink: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub link: Option<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub categories: Vec<String>,
    #[serde(deserialize_with = "lenient_owner")]
    pub owner: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub license: Option<String>,
    #[serde(deserialize_with = "lenient_nested")]
    pub resource: Option<RawResource>,
    #[serde(deserialize_with = "lenient_nested")]
    pub classification: Option<RawClassification>,
    #[serde(deserialize_with = "lenient_nested")]
    pub metadata: Option<RawMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawResource {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    #[serde(rename = "updatedAt", alias = "updated_at", deserialize_with = "lenient_string")]
    pub updated_at: Option<String>,
    #[serde(
        rename = "indexUpdatedAt",
        alias = "index_updated_at",
        deserialize_with = "lenient_string"
    )]
    pub index_updated_at: Option<String>,
    #[serde(rename = "createdAt", alias = "created_at", deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawClassification {
    #[serde(deserialize_with = "lenient_strings")]
    pub categories: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub tags: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub domain_category: Option<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub domain_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMetadata {
    #[serde(deserialize_with = "lenient_string")]
    pub domain: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub license: Option<String>,
}

impl RawRecord {
    /// Trimmed, non-empty identifier; the `resource` envelope wins over the flat field.
    pub fn identifier(&self) -> Option<&str> {
        let nested = self.resource.as_ref().and_then(|r| r.id.as_deref());
        first_present([nested, self.id.as_deref()])
    }

    pub fn name(&self) -> Option<&str> {
        let nested = self.resource.as_ref().and_then(|r| r.name.as_deref());
        first_present([nested, self.name.as_deref()])
    }

    pub fn kind(&self) -> Option<&str> {
        let nested = self.resource.as_ref().and_then(|r| r.kind.as_deref());
        first_present([nested, self.kind.as_deref()])
    }

    pub fn updated_at(&self) -> Option<&str> {
        let nested = self.resource.as_ref().and_then(|r| r.updated_at.as_deref());
        first_present([nested, self.updated_at.as_deref()])
    }

    pub fn index_updated_at(&self) -> Option<&str> {
        let nested = self
            .resource
            .as_ref()
            .and_then(|r| r.index_updated_at.as_deref());
        first_present([nested, self.index_updated_at.as_deref()])
    }

    pub fn created_at(&self) -> Option<&str> {
        let nested = self.resource.as_ref().and_then(|r| r.created_at.as_deref());
        first_present([nested, self.created_at.as_deref()])
    }

    pub fn permalink(&self) -> Option<&str> {
        first_present([self.permalink.as_deref(), self.link.as_deref()])
    }

    pub fn license(&self) -> Option<&str> {
        let nested = self.metadata.as_ref().and_then(|m| m.license.as_deref());
        first_present([nested, self.license.as_deref()])
    }

    pub fn owner(&self) -> Option<&str> {
        first_present([self.owner.as_deref()])
    }

    /// Tags in source order, classification tags first, without repeats.
    pub fn tags(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(class) = &self.classification {
            extend_unique(&mut out, &class.tags);
            extend_unique(&mut out, &class.domain_tags);
        }
        extend_unique(&mut out, &self.tags);
        out
    }

    pub fn categories(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(class) = &self.classification {
            extend_unique(&mut out, &class.categories);
            if let Some(domain_category) = &class.domain_category {
                extend_unique(&mut out, std::slice::from_ref(domain_category));
            }
        }
        extend_unique(&mut out, &self.categories);
        out
    }
}

fn first_present<'a, const N: usize>(candidates: [Option<&'a str>; N]) -> Option<&'a str> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
}

fn extend_unique(out: &mut Vec<String>, values: &[String]) {
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !out.iter().any(|existing| existing == value) {
            out.push(value.to_string());
        }
    }
}

fn scalar_to_string(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(scalar_to_string))
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Array(items)) => items.into_iter().filter_map(scalar_to_string).collect(),
        Some(scalar) => scalar_to_string(scalar).into_iter().collect(),
        None => Vec::new(),
    })
}

fn lenient_owner<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Object(mut map)) => map
            .remove("display_name")
            .and_then(scalar_to_string)
            .or_else(|| map.remove("id").and_then(scalar_to_string)),
        Some(other) => scalar_to_string(other),
        None => None,
    })
}

fn lenient_nested<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(value @ JsonValue::Object(_)) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

/// Which timestamp decided a record's retention fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RetentionField {
    #[serde(rename = "updatedAt")]
    UpdatedAt,
    #[serde(rename = "indexUpdatedAt")]
    IndexUpdatedAt,
    #[serde(rename = "none")]
    None,
}

impl RetentionField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdatedAt => "updatedAt",
            Self::IndexUpdatedAt => "indexUpdatedAt",
            Self::None => "none",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "updatedAt" => Some(Self::UpdatedAt),
            "indexUpdatedAt" => Some(Self::IndexUpdatedAt),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionDescriptor {
    pub field: RetentionField,
    pub since: NaiveDate,
    pub until: NaiveDate,
}

/// Canonical mirror entry. Exactly one exists per `id` after deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub host: String,
    pub permalink: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub owner: Option<String>,
    pub license: Option<String>,
    pub retention: RetentionDescriptor,
}

/// Position inside a paginated catalog: where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageCursor {
    Offset { offset: u64 },
    Continuation { token: Option<String> },
}

impl PageCursor {
    pub fn describe(&self) -> String {
        match self {
            Self::Offset { offset } => format!("offset={offset}"),
            Self::Continuation { token: Some(_) } => "continuation=<token>".to_string(),
            Self::Continuation { token: None } => "continuation=<start>".to_string(),
        }
    }
}

/// Persisted resume point for one pipeline identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub pipeline_id: String,
    pub resume_token: String,
    pub last_processed_at: DateTime<Utc>,
}

/// Mirror row: a normalized record plus observation bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRow {
    #[serde(flatten)]
    pub record: NormalizedRecord,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}
