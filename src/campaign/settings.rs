use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

pub const BATCH_SIZE_RANGE: RangeInclusive<usize> = 1..=50;
pub const BATCH_DELAY_RANGE: RangeInclusive<u64> = 10..=300;
pub const EMAIL_DELAY_RANGE: RangeInclusive<u64> = 1..=20;
pub const MAX_RETRIES_RANGE: RangeInclusive<u32> = 1..=5;

/// How recipients are grouped into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// One message per recipient.
    #[default]
    Standard,
    /// One message addressed to many recipients at once.
    Bulk,
}

/// User-chosen campaign parameters. The orchestrator takes a copy at start,
/// so editing these mid-run only affects the next fresh start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub name: String,
    pub batch_size: usize,
    /// Seconds.
    pub delay_between_batches: u64,
    /// Seconds.
    pub delay_between_emails: u64,
    pub retry_failed_emails: bool,
    pub max_retries: u32,
    pub send_mode: SendMode,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        CampaignConfig {
            name: "My Campaign".to_string(),
            batch_size: 10,
            delay_between_batches: 60,
            delay_between_emails: 3,
            retry_failed_emails: true,
            max_retries: 3,
            send_mode: SendMode::Standard,
        }
    }
}

impl CampaignConfig {
    /// Pulls every numeric field back into the range the UI allows.
    pub fn clamped(mut self) -> Self {
        self.batch_size = self
            .batch_size
            .clamp(*BATCH_SIZE_RANGE.start(), *BATCH_SIZE_RANGE.end());
        self.delay_between_batches = self
            .delay_between_batches
            .clamp(*BATCH_DELAY_RANGE.start(), *BATCH_DELAY_RANGE.end());
        self.delay_between_emails = self
            .delay_between_emails
            .clamp(*EMAIL_DELAY_RANGE.start(), *EMAIL_DELAY_RANGE.end());
        self.max_retries = self
            .max_retries
            .clamp(*MAX_RETRIES_RANGE.start(), *MAX_RETRIES_RANGE.end());
        self
    }

    pub fn email_delay(&self) -> Duration {
        Duration::from_secs(self.delay_between_emails)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.delay_between_batches)
    }

    /// Rough wall-clock estimate for sending `messages` messages: one email
    /// delay per message plus one batch delay per batch.
    pub fn estimated_duration(&self, messages: usize) -> Duration {
        let batches = messages.div_ceil(self.batch_size.max(1)) as u64;
        Duration::from_secs(
            messages as u64 * self.delay_between_emails + batches * self.delay_between_batches,
        )
    }
}
