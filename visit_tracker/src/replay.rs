//! Batch replay of recorded tracking hits.
//!
//! Reads a JSON-lines file of [`TrackingHit`]s, pushes them through a
//! [`Tracker`] with bounded concurrency and reports what happened. Hits of one
//! visitor are replayed in file order; different visitors run concurrently.

use anyhow::{anyhow, Context, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::settings::Settings;
use crate::signature::{visitor_key, TrackingHit};
use crate::store;
use crate::tracker::{Tracker, TrackerStats};

/// A hit together with its 1-based line in the input file.
#[derive(Debug, Clone)]
pub struct NumberedHit {
    pub line: usize,
    pub hit: TrackingHit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitFailure {
    pub line: usize,
    pub visitor_key: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ReplayStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Complete replay result
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub status: ReplayStatus,
    pub total_hits: usize,
    pub new_visits: usize,
    pub continued_visits: usize,
    pub failed_hits: usize,
    pub total_duration_ms: u64,
    pub failures: Vec<HitFailure>,
    pub tracker: TrackerStats,
}

/// Replay `hits_path` against the store configured in `settings`
#[instrument(skip(settings))]
pub async fn run(hits_path: PathBuf, output: Option<PathBuf>, settings: Settings) -> Result<()> {
    info!("Starting replay from {:?}", hits_path);

    let hits = load_hits(&hits_path).context("Failed to load tracking hits")?;
    info!("Loaded {} hits", hits.len());

    let store = store::open(&settings.store).context("Failed to open visit store")?;
    let tracker = Arc::new(Tracker::from_settings(&settings, store)?);

    let report = replay(tracker, hits, settings.replay.max_concurrent_hits).await;

    print_replay_summary(&report);

    if let Some(path) = output.or(settings.replay.output_file) {
        save_report(&report, &path).context("Failed to save replay report")?;
    }

    match report.status {
        ReplayStatus::Success => Ok(()),
        ReplayStatus::PartialSuccess => {
            warn!("Replay completed with {} failed hits", report.failed_hits);
            Ok(())
        }
        ReplayStatus::Failed => {
            error!("Replay failed");
            Err(anyhow!("Replay failed: none of {} hits were tracked", report.total_hits))
        }
    }
}

/// Parse a JSON-lines file, skipping blank lines and `#` comments
pub fn load_hits(path: &Path) -> Result<Vec<NumberedHit>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read hits file: {:?}", path))?;

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(i, line)| -> Result<NumberedHit> {
            let hit: TrackingHit = serde_json::from_str(line)
                .with_context(|| format!("Invalid hit on line {}", i + 1))?;
            Ok(NumberedHit { line: i + 1, hit })
        })
        .collect()
}

/// Track `hits` with at most `max_concurrent` visitors in flight
pub async fn replay(tracker: Arc<Tracker>, hits: Vec<NumberedHit>, max_concurrent: usize) -> ReplayReport {
    let start_time = Instant::now();
    let total_hits = hits.len();

    let mut order: Vec<String> = Vec::new();
    let mut by_visitor: HashMap<String, Vec<NumberedHit>> = HashMap::new();
    for numbered in hits {
        let key = visitor_key(&numbered.hit.visitor_id);
        by_visitor
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(numbered);
    }

    let results: Vec<Vec<(usize, std::result::Result<bool, HitFailure>)>> = stream::iter(order)
        .map(|key| {
            let tracker = tracker.clone();
            let queue = by_visitor.remove(&key).unwrap_or_default();
            async move {
                let mut results = Vec::with_capacity(queue.len());
                for NumberedHit { line, hit } in queue {
                    let result = match tracker.track(&hit).await {
                        Ok(outcome) => Ok(outcome.outcome.is_new()),
                        Err(e) => {
                            warn!("Hit on line {} failed: {}", line, e);
                            Err(HitFailure {
                                line,
                                visitor_key: key.clone(),
                                error: e.to_string(),
                            })
                        }
                    };
                    results.push((line, result));
                }
                results
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut new_visits = 0;
    let mut continued_visits = 0;
    let mut failures = Vec::new();
    for (_, result) in results.into_iter().flatten() {
        match result {
            Ok(true) => new_visits += 1,
            Ok(false) => continued_visits += 1,
            Err(failure) => failures.push(failure),
        }
    }
    failures.sort_by_key(|f| f.line);

    let failed_hits = failures.len();
    let status = if failed_hits == 0 {
        ReplayStatus::Success
    } else if failed_hits < total_hits {
        ReplayStatus::PartialSuccess
    } else {
        ReplayStatus::Failed
    };

    ReplayReport {
        status,
        total_hits,
        new_visits,
        continued_visits,
        failed_hits,
        total_duration_ms: start_time.elapsed().as_millis() as u64,
        failures,
        tracker: tracker.stats(),
    }
}

fn print_replay_summary(report: &ReplayReport) {
    println!("\n=== Replay Summary ===");
    println!("Status: {:?}", report.status);
    println!("Total Hits: {}", report.total_hits);
    println!("New Visits: {}", report.new_visits);
    println!("Continued Visits: {}", report.continued_visits);
    println!("Failed: {}", report.failed_hits);
    println!("Conflicts Retried: {}", report.tracker.conflicts);
    println!("Duration: {}ms", report.total_duration_ms);

    if report.failed_hits > 0 {
        println!("\nFailed Hits:");
        for failure in &report.failures {
            println!("  - line {} ({}): {}", failure.line, failure.visitor_key, failure.error);
        }
    }
    println!("======================\n");
}

fn save_report(report: &ReplayReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .context("Failed to serialize replay report")?;

    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to: {:?}", path))?;

    info!("Replay report saved to: {:?}", path);
    Ok(())
}
