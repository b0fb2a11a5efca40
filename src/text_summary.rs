//! Text summary builder for CLI output.
//!
//! This module computes metrics and formats human-readable lines for text mode.

use crate::aggregate::AggregateManifest;
use crate::metrics;
use crate::model::{RunState, TileOutcome};
use crate::orchestrator::FinalReport;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished run.
pub(crate) fn build_text_summary(report: &FinalReport) -> TextSummary {
    let manifest = &report.manifest;
    let mut lines = Vec::new();

    lines.push(format!("Run: {}", report.run_id));
    if let Some(outcome) = manifest.outcome {
        lines.push(format!("Outcome: {outcome}"));
    }
    lines.push(format!(
        "Elapsed: {}",
        humantime::format_duration(std::time::Duration::from_secs(report.elapsed.as_secs()))
    ));

    let counts = tile_counts(manifest);
    lines.push(format!(
        "Tiles: {} total, {} succeeded ({} up to date), {} failed, {} invalid, {} cancelled",
        manifest.tiles.len(),
        counts.succeeded,
        report.reused,
        counts.gave_up,
        counts.invalid,
        counts.cancelled
    ));

    let attempts: Vec<_> = manifest.tiles.values().flat_map(|e| e.results.iter()).collect();
    let retried = attempts.iter().filter(|r| r.attempt > 1).count();
    let timed_out = attempts.iter().filter(|r| r.state == RunState::TimedOut).count();
    lines.push(format!(
        "Attempts: {} ({} retries, {} timeouts)",
        attempts.iter().filter(|r| !r.reused).count(),
        retried,
        timed_out
    ));

    let durations = metrics::attempt_durations_secs(attempts.iter().copied());
    if let Some((mean, median, p25, p75)) = metrics::compute_metrics(&durations) {
        lines.push(format!(
            "Model runtime: avg {:.1} med {:.1} p25 {:.1} p75 {:.1} s",
            mean, median, p25, p75
        ));
    }

    match &manifest.combined {
        Some(combined) => {
            for (product, out) in &combined.products {
                let target = out.merged.as_ref().unwrap_or(&out.inputs);
                lines.push(format!(
                    "Mosaic {}: {} tiles -> {}",
                    product.name(),
                    out.tiles.len(),
                    target.display()
                ));
                if let Some(err) = &out.merge_error {
                    lines.push(format!("  merge failed: {err}"));
                }
            }
        }
        None if !manifest.failed_tiles.is_empty() => {
            lines.push("Mosaic: withheld (not every tile succeeded)".to_string());
        }
        None => {}
    }

    for tile_id in &manifest.failed_tiles {
        let Some(entry) = manifest.tiles.get(tile_id) else {
            continue;
        };
        let detail = match &entry.outcome {
            Some(TileOutcome::Invalid { missing }) => {
                let kinds: Vec<String> = missing.iter().map(|k| k.to_string()).collect();
                format!("invalid, missing {}", kinds.join(", "))
            }
            Some(TileOutcome::Cancelled) => "cancelled".to_string(),
            _ => {
                let last = entry.results.last();
                let error = last.and_then(|r| r.error.as_deref()).unwrap_or("unknown error");
                format!(
                    "failed after {} attempt(s): {}",
                    last.map(|r| r.attempt).unwrap_or(0),
                    error
                )
            }
        };
        lines.push(format!("  {tile_id}: {detail}"));
    }

    TextSummary { lines }
}

#[derive(Default)]
struct OutcomeCounts {
    succeeded: usize,
    gave_up: usize,
    invalid: usize,
    cancelled: usize,
}

fn tile_counts(manifest: &AggregateManifest) -> OutcomeCounts {
    let mut c = OutcomeCounts::default();
    for entry in manifest.tiles.values() {
        match entry.outcome {
            Some(TileOutcome::Succeeded) => c.succeeded += 1,
            Some(TileOutcome::GaveUp) => c.gave_up += 1,
            Some(TileOutcome::Invalid { .. }) => c.invalid += 1,
            Some(TileOutcome::Cancelled) | None => c.cancelled += 1,
        }
    }
    c
}
