//! Per-run report files: a JSON summary and a short markdown brief.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::IngestResult;

pub const SUMMARY_FILE: &str = "ingest_summary.json";
pub const BRIEF_FILE: &str = "brief.md";

pub fn brief_markdown(result: &IngestResult) -> String {
    let mut lines = vec![
        "# Catalog Mirror Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", result.run_id),
        format!("- Started: {}", result.started_at),
        format!("- Finished: {}", result.finished_at),
        format!("- Records processed: {}", result.total_processed),
        format!("- Completed hosts: {}", result.completed_hosts.len()),
        String::new(),
        "## Hosts".to_string(),
    ];
    for host in &result.hosts {
        lines.push(format!(
            "- {}: {:?}, {} processed ({} new, {} updated), {} retired, {} stale excluded{}",
            host.host,
            host.status,
            host.processed,
            host.counts.inserted,
            host.counts.updated,
            host.retired,
            host.stats.stale_excluded,
            if host.resumed { ", resumed" } else { "" },
        ));
    }
    if !result.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        for err in &result.errors {
            lines.push(format!("- {} ({:?}): {}", err.host, err.kind, err.message));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<root>/<run_id>/` and returns that directory.
pub async fn write_run_report(root: &Path, result: &IngestResult) -> Result<PathBuf> {
    let dir = root.join(result.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary = serde_json::to_vec_pretty(result).context("serializing ingest summary")?;
    fs::write(dir.join(SUMMARY_FILE), summary)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(dir.join(BRIEF_FILE), brief_markdown(result))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(dir)
}

/// Markdown index of the most recent `runs` reports under `root`, newest first.
pub fn recent_reports_markdown(root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(SUMMARY_FILE).is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Catalog Mirror Runs".to_string(), String::new()];
    for entry in dirs.into_iter().take(runs.max(1)) {
        let path = entry.path().join(SUMMARY_FILE);
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        let processed = summary
            .get("total_processed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let errors = summary
            .get("errors")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let started = summary
            .get("started_at")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{}`", entry.file_name().to_string_lossy()));
        lines.push(format!("- started: {started}"));
        lines.push(format!("- processed: {processed}"));
        lines.push(format!("- host errors: {errors}"));
        lines.push(format!("- summary: `{}`", path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
