//! In-process visit statistics, fed by the storage stage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

use crate::result::TaskSummary;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct VisitStats {
    started: DateTime<Utc>,
    completed: usize,
    succeeded: usize,
    failed: usize,
    total_resources: usize,
}

impl VisitStats {
    fn new() -> Self {
        Self {
            started: Utc::now(),
            completed: 0,
            succeeded: 0,
            failed: 0,
            total_resources: 0,
        }
    }

    fn record(&mut self, summary: &TaskSummary) {
        self.completed += 1;
        if summary.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_resources += summary.num_resources;
    }

    fn report(&self) {
        let elapsed = (Utc::now() - self.started).num_seconds().max(1);
        info!(
            completed = self.completed,
            succeeded = self.succeeded,
            failed = self.failed,
            resources = self.total_resources,
            tasks_per_minute = self.completed as f64 * 60.0 / elapsed as f64,
            "visit statistics"
        );
    }
}

/// Consumes task summaries until the pipeline drains, logging a summary
/// line periodically and once more at shutdown.
pub async fn run(mut summaries: mpsc::Receiver<TaskSummary>, port: u16) {
    info!(port, "visit monitor running");

    let mut stats = VisitStats::new();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            summary = summaries.recv() => match summary {
                Some(summary) => stats.record(&summary),
                None => break,
            },
            _ = ticker.tick() => stats.report(),
        }
    }

    stats.report();
}
