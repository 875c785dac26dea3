//! Coordinator — owns every message being decoded.
//!
//! Each started message gets its own task that runs rounds strictly in
//! sequence; different messages run independently. After every round the
//! message summary is republished to the store, and for pre-shared
//! messages the matched reports are decrypted and stored alongside it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use modem_core::keybook::KeyBook;
use modem_core::message::{
    DecryptedObservation, Message, MessageError, MessageSummary, Observation, Seeding,
};
use modem_core::wire::Keystream;

use crate::decrypt::{DecryptPipeline, PrivateKeyMap};
use crate::message_store::{MessageNotFound, MessageStore};
use crate::round::{RoundController, RoundResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub device_id: u32,
    /// Falls back to the configured width.
    #[serde(default)]
    pub chunk_bits: Option<u8>,
    #[serde(default)]
    pub pre_shared: bool,
}

#[derive(Debug, Clone)]
pub struct DecodeDefaults {
    pub chunk_bits: u8,
    pub keystream: Keystream,
    pub silence_limit: u32,
}

impl Default for DecodeDefaults {
    fn default() -> Self {
        Self {
            chunk_bits: 8,
            keystream: Keystream::default(),
            silence_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub messages: usize,
    pub running: usize,
    pub token_loaded: bool,
    pub keybook_loaded: bool,
    pub decrypt_threads: usize,
}

#[derive(Clone)]
pub struct Coordinator {
    store: MessageStore,
    /// `None` until a search-party token is available.
    controller: Option<RoundController>,
    keybook: Option<Arc<KeyBook>>,
    keys: Arc<PrivateKeyMap>,
    pipeline: Arc<DecryptPipeline>,
    defaults: DecodeDefaults,
    next_id: Arc<AtomicU32>,
    /// device id → message id, for messages still running
    running: Arc<DashMap<u32, u32>>,
    tasks: Arc<DashMap<u32, JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(store: MessageStore, pipeline: DecryptPipeline, defaults: DecodeDefaults) -> Self {
        Self {
            store,
            controller: None,
            keybook: None,
            keys: Arc::new(PrivateKeyMap::new()),
            pipeline: Arc::new(pipeline),
            defaults,
            next_id: Arc::new(AtomicU32::new(1)),
            running: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_controller(mut self, controller: RoundController) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_keybook(mut self, book: Arc<KeyBook>) -> Self {
        self.keys = Arc::new(book.private_keys());
        self.keybook = Some(book);
        self
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Start decoding a message and return its id.
    pub fn start(&self, request: StartRequest) -> Result<u32, CoordinatorError> {
        let controller = self
            .controller
            .clone()
            .ok_or(CoordinatorError::MissingToken)?;
        let seeding = if request.pre_shared {
            let book = self.keybook.clone().ok_or(CoordinatorError::MissingKeyBook)?;
            Seeding::PreShared(book)
        } else {
            Seeding::Derived {
                keystream: self.defaults.keystream,
            }
        };
        let chunk_bits = request.chunk_bits.unwrap_or(self.defaults.chunk_bits);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::new(id, request.device_id, chunk_bits, seeding)?
            .with_silence_limit(self.defaults.silence_limit);

        match self.running.entry(request.device_id) {
            Entry::Occupied(existing) => {
                return Err(CoordinatorError::DuplicateMessage {
                    device_id: request.device_id,
                    message_id: *existing.get(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        self.store.insert(message.summary());

        tracing::info!(
            message_id = id,
            device_id = %format!("{:#010x}", request.device_id),
            chunk_bits,
            seeding = message.seeding().kind(),
            "decode started"
        );

        // The shard stays locked until the handle is in, so a task that
        // finishes at once still finds its own entry to remove.
        if let Entry::Vacant(slot) = self.tasks.entry(id) {
            let this = self.clone();
            slot.insert(tokio::spawn(async move { this.drive(controller, message).await }));
        }
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Result<MessageSummary, CoordinatorError> {
        Ok(self.store.get(id)?)
    }

    pub fn list(&self) -> Vec<MessageSummary> {
        self.store.list()
    }

    pub fn reports(&self, id: u32) -> Result<Vec<DecryptedObservation>, CoordinatorError> {
        Ok(self.store.reports(id)?)
    }

    /// Wait for a message's task to finish and return its final summary.
    pub async fn wait(&self, id: u32) -> Result<MessageSummary, CoordinatorError> {
        if let Some((_, handle)) = self.tasks.remove(&id) {
            if let Err(e) = handle.await {
                tracing::warn!(message_id = id, error = %e, "decode task ended abnormally");
            }
        }
        self.get(id)
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            messages: self.store.count(),
            running: self.running.len(),
            token_loaded: self.controller.is_some(),
            keybook_loaded: self.keybook.is_some(),
            decrypt_threads: self.pipeline.threads(),
        }
    }

    /// Mark every running decode failed, then abort it.
    pub fn shutdown(&self) {
        for entry in self.running.iter() {
            if let Err(e) = self.store.fail(*entry.value(), "shut down") {
                tracing::debug!(error = %e, "message gone before shutdown");
            }
        }
        tracing::info!(messages = self.running.len(), "decodes shut down");
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
        self.running.clear();
    }

    async fn drive(self, controller: RoundController, mut message: Message) {
        let id = message.id;
        let decrypt = matches!(message.seeding(), Seeding::PreShared(_));

        loop {
            let result = controller.run_round(&mut message).await;
            let report = match &result {
                RoundResult::Continue(report) => Some(report),
                RoundResult::Terminated { report, .. } => report.as_ref(),
                RoundResult::Failed(_) => None,
            };
            if let Some(report) = report {
                if decrypt && !report.observations.is_empty() {
                    self.decrypt_into_store(id, report.observations.clone()).await;
                }
            }
            if self.store.update(message.summary()).is_err() {
                tracing::info!(message_id = id, "message removed, stopping decode");
                break;
            }

            match result {
                RoundResult::Continue(_) => {}
                RoundResult::Terminated { reason, .. } => {
                    tracing::info!(message_id = id, ?reason, text = %message.text(), "decode finished");
                    break;
                }
                RoundResult::Failed(failure) => {
                    tracing::warn!(message_id = id, error = %failure, "decode failed");
                    break;
                }
            }
        }

        self.running.remove(&message.device_id);
        self.tasks.remove(&id);
    }

    async fn decrypt_into_store(&self, id: u32, observations: Vec<Observation>) {
        let pipeline = self.pipeline.clone();
        let keys = self.keys.clone();
        let results = tokio::task::spawn_blocking(move || pipeline.decrypt_all(&observations, &keys)).await;
        match results {
            Ok(results) => {
                let opened: Vec<DecryptedObservation> = results.into_iter().flatten().collect();
                if opened.is_empty() {
                    return;
                }
                tracing::debug!(message_id = id, reports = opened.len(), "reports decrypted");
                if let Err(e) = self.store.add_reports(id, opened) {
                    tracing::debug!(error = %e, "dropping decrypted reports");
                }
            }
            Err(e) => tracing::warn!(message_id = id, error = %e, "decrypt task failed"),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no search-party token loaded")]
    MissingToken,

    #[error("no key book loaded")]
    MissingKeyBook,

    #[error("device {device_id:#010x} is already being decoded as message {message_id}")]
    DuplicateMessage { device_id: u32, message_id: u32 },

    #[error(transparent)]
    NotFound(#[from] MessageNotFound),

    #[error(transparent)]
    Message(#[from] MessageError),
}
