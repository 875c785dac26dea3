//! Message state — one logical exfiltration stream decoded round by round.
//!
//! A `Message` owns every candidate key generated for it, the accumulated
//! payload window the next round's keys are built from, and the bit buffer
//! that turns per-round chunk values back into bytes.
//!
//! Bit order: the stream is packed MSB-first across rounds. Round 0's value
//! is the most significant part of the stream, and a byte is emitted as
//! soon as eight bits are buffered. A valid zero byte is the terminator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keybook::KeyBook;
use crate::wire::{self, Keystream, ReportRecord, WireError, ADVERTISED_KEY_LEN, PAYLOAD_LEN};

pub use crate::wire::KeyHash;

/// Rendered in place of bytes that could not be decoded.
pub const PLACEHOLDER: u8 = b'?';

// ── Candidates and observations ───────────────────────────────────────────────

/// One hypothesis: "in `round` the beacon sent `value`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateKey {
    pub round: u32,
    pub value: u32,
    pub public_key: [u8; ADVERTISED_KEY_LEN],
    pub key_hash: KeyHash,
}

impl CandidateKey {
    /// Base64 hash, as submitted to the report service.
    pub fn hash_id(&self) -> String {
        wire::encode_hash(&self.key_hash)
    }
}

/// A crowd-sourced report, tagged with the key hash it was filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub key_hash: KeyHash,
    /// Unix milliseconds.
    pub date_published: u64,
    /// Encrypted location payload.
    pub payload: Bytes,
    pub status_code: Option<i64>,
}

impl Observation {
    pub fn from_record(record: &ReportRecord) -> Result<Self, WireError> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

        let payload = BASE64
            .decode(record.payload.trim())
            .map_err(|_| WireError::InvalidBase64)?;
        Ok(Self {
            key_hash: wire::decode_hash(&record.id)?,
            date_published: record.date_published,
            payload: Bytes::from(payload),
            status_code: record.status_code,
        })
    }
}

/// A report whose payload was opened with a pre-shared private key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedObservation {
    /// Base64 key hash of the originating beacon key.
    pub key_hash: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: u8,
    pub confidence: u8,
    pub status: u8,
    /// Unix seconds, from inside the payload.
    pub timestamp: u64,
    /// Unix milliseconds, from the report service.
    pub date_published: u64,
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// What one round's reports say about its chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "snake_case")]
pub enum ChunkOutcome {
    Decoded(u32),
    Unknown,
    Ambiguous(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodedByte {
    Valid(u8),
    Invalid,
}

impl DecodedByte {
    pub fn or_placeholder(self) -> u8 {
        match self {
            DecodedByte::Valid(b) => b,
            DecodedByte::Invalid => PLACEHOLDER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// A valid zero byte was decoded.
    Terminator,
    /// Too many consecutive bytes with nothing decoded.
    Silence,
    /// The configured round budget ran out.
    RoundLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum MessageState {
    Running,
    Terminated(Termination),
    Failed(String),
}

/// How candidate public keys are seeded. Chosen once, at construction.
#[derive(Debug, Clone)]
pub enum Seeding {
    /// Keys derived from device id + keystream + window by rejection sampling.
    Derived { keystream: Keystream },
    /// Keys looked up in a shared key book.
    PreShared(Arc<KeyBook>),
}

impl Seeding {
    pub fn kind(&self) -> &'static str {
        match self {
            Seeding::Derived { .. } => "derived",
            Seeding::PreShared(_) => "pre_shared",
        }
    }
}

/// Result of folding one round into the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRecord {
    pub round: u32,
    pub outcome: ChunkOutcome,
    /// Bytes that became final during this round.
    pub emitted: Vec<DecodedByte>,
    pub termination: Option<Termination>,
}

// ── Bit accumulator ───────────────────────────────────────────────────────────

/// Holds at most 7 + 16 bits between rounds.
#[derive(Debug, Clone, Default)]
struct BitAccumulator {
    bits: u32,
    /// Bits that came from a round without a decoded value.
    unknown: u32,
    len: u8,
}

impl BitAccumulator {
    fn push(&mut self, value: u32, width: u8, unknown: bool) {
        let mask = (1u32 << width) - 1;
        self.bits = (self.bits << width) | (value & mask);
        self.unknown = (self.unknown << width) | if unknown { mask } else { 0 };
        self.len += width;
    }

    /// Pop the oldest complete byte with its unknown mask.
    fn pop_byte(&mut self) -> Option<(u8, u8)> {
        if self.len < 8 {
            return None;
        }
        let shift = self.len - 8;
        let byte = (self.bits >> shift) as u8;
        let unknown = (self.unknown >> shift) as u8;
        let keep = (1u32 << shift) - 1;
        self.bits &= keep;
        self.unknown &= keep;
        self.len = shift;
        Some((byte, unknown))
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u32,
    pub device_id: u32,
    chunk_bits: u8,
    seeding: Seeding,
    round: u32,
    candidate_keys: Vec<CandidateKey>,
    /// XOR of every decoded chunk at its slot.
    window: [u8; PAYLOAD_LEN],
    working: BitAccumulator,
    decoded: Vec<DecodedByte>,
    outcomes: Vec<ChunkOutcome>,
    /// Newest report date already credited to a round, per key hash.
    credited: HashMap<KeyHash, u64>,
    silence_limit: u32,
    silent_run: u32,
    reports_matched: u64,
    state: MessageState,
}

impl Message {
    pub fn new(id: u32, device_id: u32, chunk_bits: u8, seeding: Seeding) -> Result<Self, MessageError> {
        wire::validate_chunk_bits(chunk_bits)?;
        if let Seeding::PreShared(book) = &seeding {
            if book.chunk_bits != chunk_bits || book.device_id != device_id {
                return Err(MessageError::KeyBookMismatch {
                    device_id: book.device_id,
                    chunk_bits: book.chunk_bits,
                });
            }
        }
        Ok(Self {
            id,
            device_id,
            chunk_bits,
            seeding,
            round: 0,
            candidate_keys: Vec::new(),
            window: [0u8; PAYLOAD_LEN],
            working: BitAccumulator::default(),
            decoded: Vec::new(),
            outcomes: Vec::new(),
            credited: HashMap::new(),
            silence_limit: 0,
            silent_run: 0,
            reports_matched: 0,
            state: MessageState::Running,
        })
    }

    /// End the message after `limit` consecutive silent bytes. 0 disables.
    pub fn with_silence_limit(mut self, limit: u32) -> Self {
        self.silence_limit = limit;
        self
    }

    pub fn chunk_bits(&self) -> u8 {
        self.chunk_bits
    }

    pub fn seeding(&self) -> &Seeding {
        &self.seeding
    }

    /// Completed rounds; also the index of the next round.
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn window(&self) -> &[u8; PAYLOAD_LEN] {
        &self.window
    }

    pub fn state(&self) -> &MessageState {
        &self.state
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, MessageState::Terminated(_))
    }

    pub fn is_finished(&self) -> bool {
        self.state != MessageState::Running
    }

    pub fn candidate_keys(&self) -> &[CandidateKey] {
        &self.candidate_keys
    }

    pub fn candidates_for_round(&self, round: u32) -> &[CandidateKey] {
        let per_round = wire::value_count(self.chunk_bits) as usize;
        let start = round as usize * per_round;
        self.candidate_keys
            .get(start..start + per_round)
            .unwrap_or(&[])
    }

    pub fn outcomes(&self) -> &[ChunkOutcome] {
        &self.outcomes
    }

    pub fn reports_matched(&self) -> u64 {
        self.reports_matched
    }

    /// Newest `date_published` already credited to an earlier round under
    /// `hash`. Derived keys repeat across rounds whenever a zero chunk or
    /// an undecoded round leaves the window unchanged.
    pub fn credited_until(&self, hash: &KeyHash) -> Option<u64> {
        self.credited.get(hash).copied()
    }

    /// Append the candidate set for the current round.
    ///
    /// The set must hold exactly one key per value, in value order, with
    /// distinct hashes.
    pub fn push_round_candidates(&mut self, candidates: Vec<CandidateKey>) -> Result<(), MessageError> {
        if self.is_finished() {
            return Err(MessageError::Finished(self.id));
        }
        let per_round = wire::value_count(self.chunk_bits) as usize;
        if self.candidate_keys.len() != self.round as usize * per_round {
            return Err(MessageError::CandidateMismatch(format!(
                "round {} already has candidates",
                self.round
            )));
        }
        if candidates.len() != per_round {
            return Err(MessageError::CandidateMismatch(format!(
                "expected {per_round} candidates, got {}",
                candidates.len()
            )));
        }
        let mut hashes = HashSet::with_capacity(per_round);
        for (value, candidate) in candidates.iter().enumerate() {
            if candidate.round != self.round || candidate.value as usize != value {
                return Err(MessageError::CandidateMismatch(format!(
                    "candidate ({}, {}) out of place at ({}, {value})",
                    candidate.round, candidate.value, self.round
                )));
            }
            if !hashes.insert(candidate.key_hash) {
                return Err(MessageError::CandidateMismatch(format!(
                    "duplicate key hash in round {}",
                    self.round
                )));
            }
        }
        self.candidate_keys.extend(candidates);
        Ok(())
    }

    /// Fold one round into the message, crediting the reports that backed
    /// its outcome so a later round that reuses the key does not count
    /// them again.
    pub fn record_round(&mut self, outcome: ChunkOutcome, backing: &[Observation]) -> Result<RoundRecord, MessageError> {
        let record = self.record_outcome(outcome, backing.len())?;
        for obs in backing {
            let newest = self.credited.entry(obs.key_hash).or_insert(obs.date_published);
            *newest = (*newest).max(obs.date_published);
        }
        Ok(record)
    }

    /// Fold one round's outcome into the message and advance the round.
    pub fn record_outcome(&mut self, outcome: ChunkOutcome, matched_reports: usize) -> Result<RoundRecord, MessageError> {
        if self.is_finished() {
            return Err(MessageError::Finished(self.id));
        }
        let round = self.round;
        self.reports_matched += matched_reports as u64;

        let (value, unknown) = match &outcome {
            ChunkOutcome::Decoded(v) => {
                wire::place_chunk(&mut self.window, round, self.chunk_bits, *v);
                (*v, false)
            }
            ChunkOutcome::Unknown | ChunkOutcome::Ambiguous(_) => (0, true),
        };
        self.working.push(value, self.chunk_bits, unknown);

        let before = self.decoded.len();
        let mut termination = None;
        while let Some((byte, unknown_mask)) = self.working.pop_byte() {
            if unknown_mask == 0 {
                self.silent_run = 0;
                if byte == 0 {
                    termination = Some(Termination::Terminator);
                    break;
                }
                self.decoded.push(DecodedByte::Valid(byte));
                continue;
            }

            self.decoded.push(DecodedByte::Invalid);
            // Silent: not one bit of this byte was decoded.
            if unknown_mask != 0xFF {
                self.silent_run = 0;
                continue;
            }
            self.silent_run += 1;
            if self.silence_limit > 0 && self.silent_run >= self.silence_limit {
                let keep = self.decoded.len() - self.silent_run as usize;
                self.decoded.truncate(keep);
                termination = Some(Termination::Silence);
                break;
            }
        }

        self.outcomes.push(outcome.clone());
        self.round += 1;
        if let Some(reason) = termination {
            self.state = MessageState::Terminated(reason);
        }

        Ok(RoundRecord {
            round,
            outcome,
            emitted: self.decoded[before.min(self.decoded.len())..].to_vec(),
            termination,
        })
    }

    pub fn terminate(&mut self, reason: Termination) {
        if !self.is_finished() {
            self.state = MessageState::Terminated(reason);
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.is_finished() {
            self.state = MessageState::Failed(reason.into());
        }
    }

    pub fn decoded(&self) -> &[DecodedByte] {
        &self.decoded
    }

    /// Decoded stream with invalid bytes replaced by `PLACEHOLDER`.
    pub fn decoded_bytes(&self) -> Vec<u8> {
        self.decoded.iter().map(|b| b.or_placeholder()).collect()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.decoded_bytes()).into_owned()
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            id: self.id,
            device_id: format!("{:#010x}", self.device_id),
            chunk_bits: self.chunk_bits,
            seeding: self.seeding.kind().to_string(),
            rounds: self.round,
            state: self.state.clone(),
            text: self.text(),
            decoded_hex: hex::encode(self.decoded_bytes()),
            invalid_bytes: self
                .decoded
                .iter()
                .filter(|b| **b == DecodedByte::Invalid)
                .count(),
            unknown_rounds: self
                .outcomes
                .iter()
                .filter(|o| **o == ChunkOutcome::Unknown)
                .count(),
            ambiguous_rounds: self
                .outcomes
                .iter()
                .filter(|o| matches!(o, ChunkOutcome::Ambiguous(_)))
                .count(),
            candidate_keys: self.candidate_keys.len(),
            reports_matched: self.reports_matched,
        }
    }
}

/// Serializable snapshot of a message, published after every round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: u32,
    pub device_id: String,
    pub chunk_bits: u8,
    pub seeding: String,
    pub rounds: u32,
    pub state: MessageState,
    pub text: String,
    pub decoded_hex: String,
    pub invalid_bytes: usize,
    pub unknown_rounds: usize,
    pub ambiguous_rounds: usize,
    pub candidate_keys: usize,
    pub reports_matched: u64,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MessageError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("key book is for device {device_id:#010x} with {chunk_bits}-bit chunks")]
    KeyBookMismatch { device_id: u32, chunk_bits: u8 },

    #[error("candidate set rejected: {0}")]
    CandidateMismatch(String),

    #[error("message {0} is already finished")]
    Finished(u32),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
