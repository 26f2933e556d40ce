use super::settings::SendMode;
use crate::recipients::Recipient;

/// Gmail accepts at most this many recipients on one message.
pub const MAX_RECIPIENTS_PER_MESSAGE: usize = 500;

/// One message to send: either a single recipient or a bulk group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub id: String,
    pub label: String,
    pub recipients: Vec<String>,
}

/// Splits the valid recipients into units of work, keeping input order.
/// Bulk mode uses a plain fixed-size partition.
pub fn plan_units(recipients: &[Recipient], mode: SendMode) -> Vec<WorkUnit> {
    let addresses: Vec<String> = recipients
        .iter()
        .filter(|r| r.valid)
        .map(|r| r.email.clone())
        .collect();

    match mode {
        SendMode::Standard => addresses
            .into_iter()
            .enumerate()
            .map(|(index, email)| WorkUnit {
                id: format!("email-{}", index),
                label: email.clone(),
                recipients: vec![email],
            })
            .collect(),
        SendMode::Bulk => addresses
            .chunks(MAX_RECIPIENTS_PER_MESSAGE)
            .enumerate()
            .map(|(index, chunk)| WorkUnit {
                id: format!("batch-{}", index),
                label: format!("Batch {} ({} recipients)", index + 1, chunk.len()),
                recipients: chunk.to_vec(),
            })
            .collect(),
    }
}

/// Number of send-loop batches needed for `units` units of work.
pub fn total_batches(units: usize, batch_size: usize) -> usize {
    units.div_ceil(batch_size.max(1))
}
