//! Run-loop tuning and handler-table configuration.

use crate::{Error, Result};
use std::time::Duration;

/// Upstream webhook action types forwarded to the backend by default.
pub const DEFAULT_HANDLED_TYPES: &[&str] = &[
    "createCard",
    "updateCard",
    "deleteCard",
    "copyCard",
    "moveCardToBoard",
    "moveCardFromBoard",
    "convertToCardFromCheckItem",
    "addAttachmentToCard",
    "deleteAttachmentFromCard",
    "addChecklistToCard",
    "removeChecklistFromCard",
    "updateCheckItemStateOnCard",
    "addLabelToCard",
    "removeLabelFromCard",
    "createLabel",
    "updateLabel",
    "deleteLabel",
    "commentCard",
    "updateComment",
    "deleteComment",
    "createList",
    "updateList",
    "moveListToBoard",
    "moveListFromBoard",
    "updateBoard",
];

/// Tuning for one consumer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Envelopes per batch before dispatching early.
    pub batch_size: usize,

    /// Longest wait for a batch to fill.
    pub batch_wait: Duration,

    /// Process lifetime; checked after every cycle.
    pub lifetime: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_wait: Duration::from_secs(15),
            lifetime: Duration::from_secs(170),
        }
    }
}

impl ConsumerConfig {
    /// Reject settings that would make the run loop spin or never dispatch.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be at least 1".to_string()));
        }
        if self.batch_wait.is_zero() {
            return Err(Error::Config("batch wait must be non-zero".to_string()));
        }
        if self.lifetime < self.batch_wait {
            tracing::warn!(
                lifetime = ?self.lifetime,
                batch_wait = ?self.batch_wait,
                "Lifetime is shorter than one batch wait; the consumer will run a single cycle"
            );
        }
        Ok(())
    }
}

/// Parse a comma-separated list of event types, dropping blanks and duplicates.
pub fn parse_type_list(raw: &str) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for t in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !types.iter().any(|seen| seen == t) {
            types.push(t.to_string());
        }
    }
    types
}
