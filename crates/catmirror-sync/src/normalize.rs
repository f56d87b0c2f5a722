//! Raw page records to canonical mirror entries: id check, retention gate,
//! latest-wins deduplication and deterministic ordering.

use std::collections::HashMap;

use catmirror_core::{NormalizedRecord, RawRecord, RetentionDescriptor, RetentionField, RetentionWindow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;

/// How many records each freshness field decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecidedBy {
    pub updated_at: u64,
    pub index_updated_at: u64,
    pub none: u64,
}

impl DecidedBy {
    fn bump(&mut self, field: RetentionField) {
        match field {
            RetentionField::UpdatedAt => self.updated_at += 1,
            RetentionField::IndexUpdatedAt => self.index_updated_at += 1,
            RetentionField::None => self.none += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub pre_count: u64,
    pub post_count: u64,
    pub missing_id: u64,
    pub stale_excluded: u64,
    pub duplicates_collapsed: u64,
    pub decided_by: DecidedBy,
}

impl std::ops::AddAssign for NormalizeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.pre_count += rhs.pre_count;
        self.post_count += rhs.post_count;
        self.missing_id += rhs.missing_id;
        self.stale_excluded += rhs.stale_excluded;
        self.duplicates_collapsed += rhs.duplicates_collapsed;
        self.decided_by.updated_at += rhs.decided_by.updated_at;
        self.decided_by.index_updated_at += rhs.decided_by.index_updated_at;
        self.decided_by.none += rhs.decided_by.none;
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutput {
    pub normalized: Vec<NormalizedRecord>,
    pub stats: NormalizeStats,
    /// Freshness of the copy kept for each id.
    pub freshness: HashMap<String, Option<DateTime<Utc>>>,
}

/// Freshness of the copy already committed for each id during one sweep, so a
/// repeat on a later page only replaces it when strictly newer.
#[derive(Debug, Default)]
pub struct LatestSeen {
    by_id: HashMap<String, Option<DateTime<Utc>>>,
}

impl LatestSeen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drops records whose id was already kept at least as fresh, and remembers the
    /// rest. Dropped records count as collapsed duplicates.
    pub fn retain_newer(&mut self, output: &mut NormalizeOutput) {
        let freshness = &output.freshness;
        let by_id = &mut self.by_id;
        let before = output.normalized.len();
        output.normalized.retain(|record| {
            let fresh = freshness.get(&record.id).copied().flatten();
            let newer = by_id.get(&record.id).map_or(true, |kept| fresh > *kept);
            if newer {
                by_id.insert(record.id.clone(), fresh);
            }
            newer
        });
        let dropped = (before - output.normalized.len()) as u64;
        output.stats.duplicates_collapsed += dropped;
        output.stats.post_count -= dropped;
    }
}

/// Parses the timestamp shapes catalogs emit: RFC 3339, naive date-times,
/// bare dates and epoch seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// First parseable freshness timestamp and the field it came from.
pub fn freshness(record: &RawRecord) -> (Option<DateTime<Utc>>, RetentionField) {
    if let Some(ts) = record.updated_at().and_then(parse_timestamp) {
        return (Some(ts), RetentionField::UpdatedAt);
    }
    if let Some(ts) = record.index_updated_at().and_then(parse_timestamp) {
        return (Some(ts), RetentionField::IndexUpdatedAt);
    }
    (None, RetentionField::None)
}

struct Kept {
    record: NormalizedRecord,
    freshness: Option<DateTime<Utc>>,
}

pub fn normalize_all(
    raw: Vec<RawRecord>,
    host: &str,
    window: &RetentionWindow,
    include_stale: bool,
) -> NormalizeOutput {
    let mut stats = NormalizeStats {
        pre_count: raw.len() as u64,
        ..NormalizeStats::default()
    };
    let mut kept: Vec<Kept> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in raw {
        let Some(id) = record.identifier().map(str::to_string) else {
            stats.missing_id += 1;
            continue;
        };
        let (fresh, field) = freshness(&record);
        stats.decided_by.bump(field);

        if let Some(ts) = fresh {
            if !include_stale && window.is_stale(ts.date_naive()) {
                stats.stale_excluded += 1;
                continue;
            }
        }

        let candidate = Kept {
            record: to_normalized(&record, id.clone(), host, field, window),
            freshness: fresh,
        };
        match index.get(&id) {
            Some(&slot) => {
                stats.duplicates_collapsed += 1;
                // Option orders None first, so any known date beats an unknown one.
                if candidate.freshness > kept[slot].freshness {
                    kept[slot] = candidate;
                }
            }
            None => {
                index.insert(id, kept.len());
                kept.push(candidate);
            }
        }
    }

    let freshness = kept
        .iter()
        .map(|k| (k.record.id.clone(), k.freshness))
        .collect();
    let mut normalized: Vec<NormalizedRecord> = kept.into_iter().map(|k| k.record).collect();
    normalized.sort_by(|a, b| {
        let name_a = a.name.as_deref().unwrap_or("");
        let name_b = b.name.as_deref().unwrap_or("");
        name_a.cmp(name_b).then_with(|| a.id.cmp(&b.id))
    });
    stats.post_count = normalized.len() as u64;

    NormalizeOutput {
        normalized,
        stats,
        freshness,
    }
}

/// ISO-8601 timestamps pass through untouched; other parseable shapes such as epoch
/// seconds are rendered as RFC 3339. Values that do not parse are dropped.
pub fn iso_timestamp(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let is_iso = DateTime::parse_from_rfc3339(trimmed).is_ok()
        || NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok();
    if is_iso {
        return Some(trimmed.to_string());
    }
    parse_timestamp(trimmed).map(|ts| ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn to_normalized(
    record: &RawRecord,
    id: String,
    host: &str,
    field: RetentionField,
    window: &RetentionWindow,
) -> NormalizedRecord {
    let owned = |value: Option<&str>| value.map(str::to_string);
    NormalizedRecord {
        id,
        name: owned(record.name()),
        kind: owned(record.kind()),
        host: host.to_string(),
        permalink: owned(record.permalink()),
        created_at: record.created_at().and_then(iso_timestamp),
        updated_at: record.updated_at().and_then(iso_timestamp),
        tags: record.tags(),
        categories: record.categories(),
        owner: owned(record.owner()),
        license: owned(record.license()),
        retention: RetentionDescriptor {
            field,
            since: window.since,
            until: window.until,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: Option<&str>, name: Option<&str>, updated: Option<&str>) -> RawRecord {
        RawRecord {
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            updated_at: updated.map(str::to_string),
            ..RawRecord::default()
        }
    }

    fn window(since: &str) -> RetentionWindow {
        RetentionWindow::parse(Some(since), Some("2026-01-01"), NaiveDate::MIN).unwrap()
    }

    #[test]
    fn duplicate_and_undated_records_resolve_to_two_entries() {
        let input = vec![
            raw(Some("a"), None, Some("2025-01-01")),
            raw(Some("a"), None, Some("2025-02-01")),
            raw(Some("b"), None, None),
        ];
        let out = normalize_all(input, "data.city.gov", &window("2024-01-01"), false);

        assert_eq!(out.normalized.len(), 2);
        assert_eq!(out.normalized[0].id, "a");
        assert_eq!(out.normalized[0].updated_at.as_deref(), Some("2025-02-01"));
        assert_eq!(out.normalized[1].id, "b");
        assert_eq!(out.normalized[1].retention.field, RetentionField::None);
        assert_eq!(out.stats.pre_count, 3);
        assert_eq!(out.stats.post_count, 2);
        assert_eq!(out.stats.duplicates_collapsed, 1);
        assert_eq!(out.stats.decided_by.updated_at, 2);
        assert_eq!(out.stats.decided_by.none, 1);
    }

    #[test]
    fn stale_records_follow_the_include_flag() {
        let input = || vec![raw(Some("old"), None, Some("2023-12-31T23:59:59Z"))];
        let excluded = normalize_all(input(), "h", &window("2024-01-01"), false);
        assert!(excluded.normalized.is_empty());
        assert_eq!(excluded.stats.stale_excluded, 1);

        let included = normalize_all(input(), "h", &window("2024-01-01"), true);
        assert_eq!(included.normalized.len(), 1);
    }

    #[test]
    fn the_gate_compares_days_not_instants() {
        let input = vec![raw(Some("edge"), None, Some("2024-01-01T00:00:01+00:00"))];
        let out = normalize_all(input, "h", &window("2024-01-01"), false);
        assert_eq!(out.normalized.len(), 1);
    }

    #[test]
    fn ties_and_unknown_dates_keep_the_first_seen() {
        let input = vec![
            raw(Some("x"), Some("first"), Some("2025-05-05")),
            raw(Some("x"), Some("second"), Some("2025-05-05")),
            raw(Some("y"), Some("dated"), Some("2025-01-01")),
            raw(Some("y"), Some("undated"), None),
            raw(Some("z"), Some("z-first"), None),
            raw(Some("z"), Some("z-second"), None),
        ];
        let out = normalize_all(input, "h", &window("2024-01-01"), false);
        let names: Vec<_> = out.normalized.iter().filter_map(|r| r.name.as_deref()).collect();
        assert_eq!(names, vec!["dated", "first", "z-first"]);
    }

    #[test]
    fn index_timestamp_is_the_fallback_signal() {
        let mut record = raw(Some("i"), None, Some("not a date"));
        record.index_updated_at = Some("2019-06-01".into());
        let out = normalize_all(vec![record], "h", &window("2024-01-01"), false);
        assert!(out.normalized.is_empty());
        assert_eq!(out.stats.decided_by.index_updated_at, 1);
    }

    #[test]
    fn records_without_ids_are_counted_and_dropped() {
        let input = vec![raw(None, Some("nameless"), None), raw(Some("  "), None, None)];
        let out = normalize_all(input, "h", &window("2024-01-01"), false);
        assert!(out.normalized.is_empty());
        assert_eq!(out.stats.missing_id, 2);
    }

    #[test]
    fn output_is_sorted_by_name_then_id() {
        let input = vec![
            raw(Some("2"), Some("Budget"), None),
            raw(Some("1"), Some("Budget"), None),
            raw(Some("3"), None, None),
        ];
        let out = normalize_all(input, "h", &window("2024-01-01"), false);
        let ids: Vec<_> = out.normalized.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1", "2"]);
    }

    #[test]
    fn stored_timestamps_are_iso_8601() {
        let mut record = raw(Some("e"), None, Some("1741064767"));
        record.created_at = Some("2025-03-04 05:06:07".into());
        let out = normalize_all(vec![record], "h", &window("2024-01-01"), false);
        let stored = &out.normalized[0];
        assert_eq!(stored.updated_at.as_deref(), Some("2025-03-04T05:06:07Z"));
        assert_eq!(stored.created_at.as_deref(), Some("2025-03-04T05:06:07Z"));

        assert_eq!(iso_timestamp("2025-02-01").as_deref(), Some("2025-02-01"));
        assert_eq!(iso_timestamp(" 2025-02-01T10:00:00+01:00").as_deref(), Some("2025-02-01T10:00:00+01:00"));
        assert_eq!(iso_timestamp("not a date"), None);
    }

    #[test]
    fn later_batches_only_replace_older_copies() {
        let window = window("2024-01-01");
        let mut latest = LatestSeen::new();

        let mut first = normalize_all(
            vec![raw(Some("a"), None, Some("2025-01-01")), raw(Some("b"), None, Some("2025-06-01"))],
            "h",
            &window,
            false,
        );
        latest.retain_newer(&mut first);
        assert_eq!(first.normalized.len(), 2);

        let mut second = normalize_all(
            vec![
                raw(Some("a"), Some("newer"), Some("2025-02-01")),
                raw(Some("b"), Some("older"), Some("2025-05-01")),
                raw(Some("c"), None, None),
            ],
            "h",
            &window,
            false,
        );
        latest.retain_newer(&mut second);
        let ids: Vec<_> = second.normalized.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(second.stats.post_count, 2);
        assert_eq!(second.stats.duplicates_collapsed, 1);

        let mut third = normalize_all(vec![raw(Some("c"), None, None)], "h", &window, false);
        latest.retain_newer(&mut third);
        assert!(third.normalized.is_empty(), "an undated repeat never replaces");
        assert_eq!(latest.len(), 3);
    }

    #[test]
    fn timestamps_in_common_shapes_parse() {
        for raw in ["2025-03-04", "2025-03-04T05:06:07", "2025-03-04T05:06:07.123Z", "1741064767"] {
            let parsed = parse_timestamp(raw).unwrap();
            assert_eq!(parsed.date_naive(), NaiveDate::from_ymd_opt(2025, 3, 4).unwrap(), "{raw}");
        }
        assert!(parse_timestamp("soon").is_none());
    }
}
