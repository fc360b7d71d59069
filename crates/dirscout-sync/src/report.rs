use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dirscout_core::{FieldValue, ScrapeStatistics, StandardFields};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::location::ResolverStats;

/// What a dry run would have persisted for one listing.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunRecord {
    pub url: String,
    #[serde(flatten)]
    pub fields: StandardFields,
    pub custom_fields: BTreeMap<String, FieldValue>,
    pub location_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub source_name: String,
    pub category_slug: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub urls_enumerated: usize,
    pub statistics: ScrapeStatistics,
    pub resolver: ResolverStats,
    #[serde(skip)]
    pub dry_run_records: Vec<DryRunRecord>,
}

/// Minimal view of a `summary.json`, for listing past runs.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSummaryFile {
    pub run_id: Uuid,
    pub source_id: String,
    pub category_slug: String,
    pub dry_run: bool,
    pub finished_at: DateTime<Utc>,
    pub statistics: ScrapeStatistics,
}

/// Write `summary.json`, `summary.md` and, for dry runs, `dry_run.json`
/// under `<workspace_root>/reports/<run_id>/`.
pub async fn write_reports(workspace_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), summary)
        .await
        .context("writing summary.json")?;

    fs::write(reports_dir.join("summary.md"), summary_markdown(report))
        .await
        .context("writing summary.md")?;

    if report.dry_run {
        let records = serde_json::to_vec_pretty(&report.dry_run_records)
            .context("serializing dry run records")?;
        fs::write(reports_dir.join("dry_run.json"), records)
            .await
            .context("writing dry_run.json")?;
    }

    Ok(reports_dir)
}

fn summary_markdown(report: &RunReport) -> String {
    let s = &report.statistics;
    let counters = [
        ("fetched", s.listings_fetched),
        ("saved", s.listings_saved),
        ("skipped (duplicate)", s.listings_skipped_duplicate),
        ("failed", s.listings_failed),
        ("parse failures", s.parse_failures),
        ("locations unresolved", s.locations_unresolved),
        ("custom fields populated", s.custom_fields_populated),
        ("rate limit delays", s.rate_limit_delays),
        ("robots blocked", s.robots_blocked),
    ];
    format!(
        "# Ingestion run `{}`\n\n- Source: {} (`{}`)\n- Category: `{}`\n- Dry run: {}\n- Started: {}\n- Finished: {}\n- URLs enumerated: {}\n- Deadline exceeded: {}\n\n## Statistics\n{}\n\n## Location cache\n- hits: {}\n- misses: {}\n- created: {}\n- parse errors: {}\n- hit rate: {:.1}%\n",
        report.run_id,
        report.source_name,
        report.source_id,
        report.category_slug,
        report.dry_run,
        report.started_at,
        report.finished_at,
        report.urls_enumerated,
        s.deadline_exceeded,
        counters
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n"),
        report.resolver.cache_hits,
        report.resolver.cache_misses,
        report.resolver.created_locations,
        report.resolver.parse_errors,
        report.resolver.cache_hit_rate * 100.0,
    )
}

/// The most recent `runs` summaries under `<workspace_root>/reports`, newest first.
pub fn recent_runs(workspace_root: &Path, runs: usize) -> Result<Vec<RunSummaryFile>> {
    let reports_root = workspace_root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path().join("summary.json");
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummaryFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    summaries.truncate(runs.max(1));
    Ok(summaries)
}
