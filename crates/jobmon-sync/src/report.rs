use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobmon_core::CycleReport;
use tokio::fs;

/// Write `<root>/<run_id>/cycle_report.json` and `brief.md`; returns the run directory.
pub async fn write_cycle_report(root: &Path, report: &CycleReport) -> Result<PathBuf> {
    let run_dir = root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing cycle report")?;
    fs::write(run_dir.join("cycle_report.json"), json)
        .await
        .context("writing cycle_report.json")?;

    fs::write(run_dir.join("brief.md"), render_brief(report))
        .await
        .context("writing brief.md")?;

    Ok(run_dir)
}

pub fn render_brief(report: &CycleReport) -> String {
    let mut by_source: BTreeMap<&str, usize> = BTreeMap::new();
    for listing in &report.new_listings {
        *by_source.entry(listing.source.as_str()).or_default() += 1;
    }

    let source_lines = if by_source.is_empty() {
        "- none".to_string()
    } else {
        by_source
            .iter()
            .map(|(source, count)| format!("- {source}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let failure_lines = if report.failed_sources.is_empty() {
        "- none".to_string()
    } else {
        report
            .failed_sources
            .iter()
            .map(|f| format!("- {} ({} @ {}): {}", f.source, f.term, f.location, f.reason))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Job Monitor Cycle Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Duration: {:.1}s\n- Records fetched: {}\n- New listings: {}\n- Duplicates skipped: {}\n- Malformed skipped: {}\n- Filtered out: {}\n- Pairs skipped: {}\n\n## New Listings by Source\n{}\n\n## Failed Sources\n{}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.duration.as_secs_f64(),
        report.records_fetched,
        report.new_count(),
        report.duplicates_skipped,
        report.malformed_skipped,
        report.filtered_out,
        report.pairs_skipped,
        source_lines,
        failure_lines,
    )
}
