use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use modem_core::message::{DecryptedObservation, MessageState, MessageSummary};

#[derive(Debug, Error)]
#[error("message {0} not found")]
pub struct MessageNotFound(pub u32);

/// In-memory message store
#[derive(Clone, Default)]
pub struct MessageStore {
    /// Latest summary per message id
    summaries: Arc<DashMap<u32, MessageSummary>>,
    /// Decrypted reports per message id, in arrival order
    reports: Arc<DashMap<u32, Vec<DecryptedObservation>>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new message
    pub fn insert(&self, summary: MessageSummary) {
        self.reports.entry(summary.id).or_default();
        self.summaries.insert(summary.id, summary);
    }

    /// Replace the summary of a tracked message. Once a message has
    /// finished its summary is final and later updates are ignored.
    pub fn update(&self, summary: MessageSummary) -> Result<(), MessageNotFound> {
        match self.summaries.get_mut(&summary.id) {
            Some(mut entry) => {
                if entry.state == MessageState::Running {
                    *entry = summary;
                }
                Ok(())
            }
            None => Err(MessageNotFound(summary.id)),
        }
    }

    /// Mark a running message failed
    pub fn fail(&self, id: u32, reason: &str) -> Result<(), MessageNotFound> {
        match self.summaries.get_mut(&id) {
            Some(mut entry) => {
                if entry.state == MessageState::Running {
                    entry.state = MessageState::Failed(reason.to_string());
                }
                Ok(())
            }
            None => Err(MessageNotFound(id)),
        }
    }

    pub fn get(&self, id: u32) -> Result<MessageSummary, MessageNotFound> {
        self.summaries
            .get(&id)
            .map(|s| s.clone())
            .ok_or(MessageNotFound(id))
    }

    /// All summaries, by id
    pub fn list(&self) -> Vec<MessageSummary> {
        let mut all: Vec<MessageSummary> = self.summaries.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn remove(&self, id: u32) -> Result<MessageSummary, MessageNotFound> {
        self.reports.remove(&id);
        self.summaries
            .remove(&id)
            .map(|(_, s)| s)
            .ok_or(MessageNotFound(id))
    }

    /// Append decrypted reports
    pub fn add_reports(&self, id: u32, reports: Vec<DecryptedObservation>) -> Result<(), MessageNotFound> {
        match self.reports.get_mut(&id) {
            Some(mut entry) => {
                entry.extend(reports);
                Ok(())
            }
            None => Err(MessageNotFound(id)),
        }
    }

    pub fn reports(&self, id: u32) -> Result<Vec<DecryptedObservation>, MessageNotFound> {
        self.reports
            .get(&id)
            .map(|r| r.clone())
            .ok_or(MessageNotFound(id))
    }

    pub fn count(&self) -> usize {
        self.summaries.len()
    }
}
