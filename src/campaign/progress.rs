use super::ledger::StatusCounts;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Numbers for the progress panel, derived from one ledger snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub counts: StatusCounts,
    /// Sent share of all units, 0-100.
    pub percent: u32,
    pub current_batch: usize,
    pub total_batches: usize,
    pub elapsed: Duration,
    pub per_minute: u32,
}

impl ProgressReport {
    pub fn new(
        counts: StatusCounts,
        current_batch: usize,
        total_batches: usize,
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let total = counts.total();
        let percent = if total == 0 {
            0
        } else {
            ((counts.sent as f64 / total as f64) * 100.0).round() as u32
        };

        let elapsed = start_time
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default();
        let elapsed_secs = elapsed.as_secs();
        let per_minute = if elapsed_secs == 0 {
            0
        } else {
            ((counts.sent as f64 / elapsed_secs as f64) * 60.0).round() as u32
        };

        ProgressReport {
            counts,
            percent,
            current_batch,
            total_batches,
            elapsed,
            per_minute,
        }
    }

    /// Pending as the UI shows it: not yet finished either way.
    pub fn outstanding(&self) -> usize {
        self.counts.pending + self.counts.sending
    }
}

/// `3m 07s` style.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m {:02}s", secs / 60, secs % 60)
}
