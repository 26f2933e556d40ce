use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("No log entry with id '{0}'")]
    UnknownEntry(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Sending => "sending",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailLogEntry {
    pub id: String,
    /// The address, or a "Batch N (M recipients)" label in bulk mode.
    pub target: String,
    pub status: EmailStatus,
    pub timestamp: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
}

impl EmailLogEntry {
    fn pending(id: String, target: String) -> Self {
        EmailLogEntry {
            id,
            target,
            status: EmailStatus::Pending,
            timestamp: None,
            error_message: None,
            retry_count: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.sending + self.sent + self.failed
    }
}

/// Ordered per-unit status records for one campaign. Insertion order is the
/// sending order. Every change swaps in a complete new entry.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<EmailLogEntry>,
    index: HashMap<String, usize>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the ledger with one fresh pending entry per `(id, target)`.
    pub fn initialize<I>(&mut self, units: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.entries = units
            .into_iter()
            .map(|(id, target)| EmailLogEntry::pending(id, target))
            .collect();
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.id.clone(), position))
            .collect();
    }

    pub fn transition(
        &mut self,
        id: &str,
        status: EmailStatus,
        timestamp: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let position = *self
            .index
            .get(id)
            .ok_or_else(|| LedgerError::UnknownEntry(id.to_string()))?;
        let updated = EmailLogEntry {
            status,
            timestamp,
            error_message: error,
            ..self.entries[position].clone()
        };
        self.entries[position] = updated;
        Ok(())
    }

    pub fn snapshot_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in &self.entries {
            match entry.status {
                EmailStatus::Pending => counts.pending += 1,
                EmailStatus::Sending => counts.sending += 1,
                EmailStatus::Sent => counts.sent += 1,
                EmailStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn entries(&self) -> &[EmailLogEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&EmailLogEntry> {
        self.index.get(id).map(|&position| &self.entries[position])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of the first `limit` pending entries, in sending order.
    pub fn pending_ids(&self, limit: usize) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.status == EmailStatus::Pending)
            .take(limit)
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Puts entries stranded in `sending` back to `pending`, except the one
    /// whose send is still in flight. Returns how many were reclaimed.
    pub fn reclaim_stale(&mut self, in_flight: Option<&str>) -> usize {
        let mut reclaimed = 0;
        for entry in self.entries.iter_mut() {
            if entry.status == EmailStatus::Sending && Some(entry.id.as_str()) != in_flight {
                *entry = EmailLogEntry {
                    status: EmailStatus::Pending,
                    ..entry.clone()
                };
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Moves failed entries with retries left back to `pending`, bumping
    /// their retry count. Returns how many were re-queued.
    pub fn requeue_failed(&mut self, max_retries: u32) -> usize {
        let mut requeued = 0;
        for entry in self.entries.iter_mut() {
            let retries = entry.retry_count.unwrap_or(0);
            if entry.status == EmailStatus::Failed && retries < max_retries {
                *entry = EmailLogEntry {
                    status: EmailStatus::Pending,
                    timestamp: None,
                    error_message: None,
                    retry_count: Some(retries + 1),
                    ..entry.clone()
                };
                requeued += 1;
            }
        }
        requeued
    }

    /// Every entry back to `pending` with no timestamp, error or retries.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = EmailLogEntry::pending(entry.id.clone(), entry.target.clone());
        }
    }
}
