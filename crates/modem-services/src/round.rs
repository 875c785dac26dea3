//! Round controller — drives one message through generate → fetch →
//! correlate → record, one round at a time.
//!
//! Candidate generation is CPU-bound and runs on the blocking pool. The
//! fetch is bounded by a timeout; a failed or stalled fetch is treated as
//! zero observations so the round still advances. Only encoder failures
//! end a message early.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;

use modem_core::auth::AuthToken;
use modem_core::message::{
    ChunkOutcome, DecodedByte, KeyHash, Message, MessageError, MessageState, Observation,
    Termination,
};

use crate::correlator::correlate;
use crate::encoder::{EncodeError, KeyEncoder};
use crate::report_source::{FetchError, QueryWindow, ReportSource};

#[derive(Debug, Clone)]
pub struct RoundSettings {
    pub lookback: Duration,
    pub timeout: Duration,
    /// Hashes per concurrent query. 0 = a single query.
    pub batch_size: usize,
    pub max_rounds: u32,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(86_400),
            timeout: Duration::from_secs(30),
            batch_size: 0,
            max_rounds: 4096,
        }
    }
}

/// What happened in one completed round.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub round: u32,
    pub outcome: ChunkOutcome,
    pub emitted: Vec<DecodedByte>,
    /// Observations backing this round's outcome.
    pub observations: Vec<Observation>,
    pub unmatched: usize,
}

#[derive(Debug)]
pub enum RoundResult {
    Continue(RoundReport),
    /// `report` is `None` when the message ended without running a round.
    Terminated {
        reason: Termination,
        report: Option<RoundReport>,
    },
    Failed(RoundFailure),
}

#[derive(Clone)]
pub struct RoundController {
    encoder: KeyEncoder,
    source: Arc<dyn ReportSource>,
    token: AuthToken,
    settings: RoundSettings,
}

impl RoundController {
    pub fn new(encoder: KeyEncoder, source: Arc<dyn ReportSource>, token: AuthToken, settings: RoundSettings) -> Self {
        Self {
            encoder,
            source,
            token,
            settings,
        }
    }

    pub fn settings(&self) -> &RoundSettings {
        &self.settings
    }

    pub async fn run_round(&self, message: &mut Message) -> RoundResult {
        match message.state() {
            MessageState::Running => {}
            MessageState::Terminated(reason) => {
                return RoundResult::Terminated {
                    reason: *reason,
                    report: None,
                }
            }
            MessageState::Failed(reason) => {
                return RoundResult::Failed(RoundFailure::AlreadyFailed(reason.clone()))
            }
        }
        if message.round() >= self.settings.max_rounds {
            tracing::info!(message_id = message.id, rounds = message.round(), "round limit reached");
            message.terminate(Termination::RoundLimit);
            return RoundResult::Terminated {
                reason: Termination::RoundLimit,
                report: None,
            };
        }

        let round = message.round();
        if let Err(failure) = self.prepare(message).await {
            tracing::warn!(message_id = message.id, round, error = %failure, "round failed");
            message.fail(failure.to_string());
            return RoundResult::Failed(failure);
        }

        let hashes: Vec<KeyHash> = message
            .candidates_for_round(round)
            .iter()
            .map(|c| c.key_hash)
            .collect();
        let observations = self.fetch(message.id, round, &hashes).await;

        let correlation = correlate(message, &observations);
        let record = match message.record_round(correlation.outcome, &correlation.matched) {
            Ok(record) => record,
            Err(e) => {
                let failure = RoundFailure::from(e);
                message.fail(failure.to_string());
                return RoundResult::Failed(failure);
            }
        };

        let report = RoundReport {
            round,
            outcome: record.outcome,
            emitted: record.emitted,
            observations: correlation.matched,
            unmatched: correlation.unmatched,
        };
        match record.termination {
            Some(reason) => {
                tracing::info!(
                    message_id = message.id,
                    rounds = message.round(),
                    ?reason,
                    text = %message.text(),
                    "message terminated"
                );
                RoundResult::Terminated {
                    reason,
                    report: Some(report),
                }
            }
            None => RoundResult::Continue(report),
        }
    }

    /// Run rounds until the message terminates or fails, calling
    /// `on_round` after each completed round.
    pub async fn run_to_end(&self, message: &mut Message, mut on_round: impl FnMut(&Message, &RoundReport)) -> RoundResult {
        loop {
            match self.run_round(message).await {
                RoundResult::Continue(report) => on_round(message, &report),
                RoundResult::Terminated { reason, report } => {
                    if let Some(report) = &report {
                        on_round(message, report);
                    }
                    return RoundResult::Terminated { reason, report };
                }
                failed => return failed,
            }
        }
    }

    /// Generate this round's candidates off the async workers and attach
    /// them to the message.
    async fn prepare(&self, message: &mut Message) -> Result<(), RoundFailure> {
        let encoder = self.encoder.clone();
        let seeding = message.seeding().clone();
        let device_id = message.device_id;
        let round = message.round();
        let chunk_bits = message.chunk_bits();
        let window = *message.window();

        let candidates = tokio::task::spawn_blocking(move || {
            encoder.round_candidates(&seeding, device_id, round, chunk_bits, &window)
        })
        .await
        .map_err(|e| RoundFailure::Join(e.to_string()))??;

        message.push_round_candidates(candidates)?;
        Ok(())
    }

    /// Query every hash, split into batches, under the timeout. Failures
    /// degrade to fewer observations.
    async fn fetch(&self, message_id: u32, round: u32, hashes: &[KeyHash]) -> Vec<Observation> {
        let window = QueryWindow::lookback(self.settings.lookback);
        let batch_size = match self.settings.batch_size {
            0 => hashes.len().max(1),
            n => n,
        };

        let queries = hashes.chunks(batch_size).map(|batch| async move {
            let result = tokio::time::timeout(self.settings.timeout, self.source.query(batch, window, &self.token))
                .await
                .unwrap_or(Err(FetchError::Timeout(self.settings.timeout)));
            match result {
                Ok(observations) => observations,
                Err(e) => {
                    tracing::warn!(message_id, round, batch = batch.len(), error = %e, "report fetch failed");
                    Vec::new()
                }
            }
        });

        let observations: Vec<Observation> = join_all(queries).await.into_iter().flatten().collect();
        tracing::debug!(
            message_id,
            round,
            hashes = hashes.len(),
            observations = observations.len(),
            "round fetched"
        );
        observations
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RoundFailure {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("candidate generation task failed: {0}")]
    Join(String),

    #[error("message already failed: {0}")]
    AlreadyFailed(String),
}
