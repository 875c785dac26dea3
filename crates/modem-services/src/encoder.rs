//! Key encoder — turns (device, round, value, accumulated window) into a
//! valid advertised key.
//!
//! Only about half of all 28-byte strings are x-coordinates of P-224 points.
//! The 16-bit counter in the key header is bumped until the oracle accepts
//! the key; both sides run the same search, so the receiver reproduces the
//! exact key a beacon broadcast.

use std::sync::Arc;

use rayon::prelude::*;
use thiserror::Error;

use modem_core::crypto::{key_hash, P224Oracle, ValidityOracle};
use modem_core::message::{CandidateKey, Seeding};
use modem_core::wire::{self, AdvertisedKey, Keystream, WireError, PAYLOAD_LEN};

/// Search the counter space for the first valid key over `payload`.
pub fn find_valid_key(oracle: &dyn ValidityOracle, device_id: u32, payload: [u8; PAYLOAD_LEN]) -> Option<AdvertisedKey> {
    (0..=u16::MAX)
        .map(|counter| AdvertisedKey::new(device_id, counter, payload))
        .find(|key| oracle.is_valid(&key.to_array()))
}

#[derive(Clone)]
pub struct KeyEncoder {
    oracle: Arc<dyn ValidityOracle>,
}

impl Default for KeyEncoder {
    fn default() -> Self {
        Self::new(Arc::new(P224Oracle))
    }
}

impl KeyEncoder {
    pub fn new(oracle: Arc<dyn ValidityOracle>) -> Self {
        Self { oracle }
    }

    /// Build the derived key for a single value.
    pub fn candidate(
        &self,
        device_id: u32,
        round: u32,
        chunk_bits: u8,
        accumulated: &[u8; PAYLOAD_LEN],
        keystream: &Keystream,
        value: u32,
    ) -> Result<CandidateKey, EncodeError> {
        let mut payload = keystream.apply(accumulated);
        wire::place_chunk(&mut payload, round, chunk_bits, value);
        let key = find_valid_key(self.oracle.as_ref(), device_id, payload)
            .ok_or(EncodeError::KeyExhausted { round, value })?;
        let public_key = key.to_array();
        Ok(CandidateKey {
            round,
            value,
            public_key,
            key_hash: key_hash(&public_key),
        })
    }

    /// One derived candidate per value in `[0, 2^chunk_bits)`, in value order.
    ///
    /// Values are searched in parallel; the first exhausted value aborts
    /// the whole round.
    pub fn generate_round_candidates(
        &self,
        device_id: u32,
        round: u32,
        chunk_bits: u8,
        accumulated: &[u8; PAYLOAD_LEN],
        keystream: &Keystream,
    ) -> Result<Vec<CandidateKey>, EncodeError> {
        wire::validate_chunk_bits(chunk_bits)?;
        (0..wire::value_count(chunk_bits))
            .into_par_iter()
            .map(|value| self.candidate(device_id, round, chunk_bits, accumulated, keystream, value))
            .collect()
    }

    /// Candidates for `round` under either seeding strategy.
    pub fn round_candidates(
        &self,
        seeding: &Seeding,
        device_id: u32,
        round: u32,
        chunk_bits: u8,
        accumulated: &[u8; PAYLOAD_LEN],
    ) -> Result<Vec<CandidateKey>, EncodeError> {
        match seeding {
            Seeding::Derived { keystream } => {
                self.generate_round_candidates(device_id, round, chunk_bits, accumulated, keystream)
            }
            Seeding::PreShared(book) => (0..wire::value_count(chunk_bits))
                .map(|value| {
                    let entry = book
                        .lookup(round, value)
                        .ok_or(EncodeError::KeyBookExhausted { round, value })?;
                    Ok(CandidateKey {
                        round,
                        value,
                        public_key: entry.public_key,
                        key_hash: entry.hash,
                    })
                })
                .collect(),
        }
    }

    /// The exact keys a beacon advertises to send `data`, one per round.
    pub fn broadcast_schedule(
        &self,
        seeding: &Seeding,
        device_id: u32,
        chunk_bits: u8,
        data: &[u8],
    ) -> Result<Vec<CandidateKey>, EncodeError> {
        let values = chunk_values(data, chunk_bits)?;
        let mut accumulated = [0u8; PAYLOAD_LEN];
        let mut schedule = Vec::with_capacity(values.len());

        for (round, value) in values.into_iter().enumerate() {
            let round = round as u32;
            let key = match seeding {
                Seeding::Derived { keystream } => {
                    self.candidate(device_id, round, chunk_bits, &accumulated, keystream, value)?
                }
                Seeding::PreShared(book) => {
                    let entry = book
                        .lookup(round, value)
                        .ok_or(EncodeError::KeyBookExhausted { round, value })?;
                    CandidateKey {
                        round,
                        value,
                        public_key: entry.public_key,
                        key_hash: entry.hash,
                    }
                }
            };
            wire::place_chunk(&mut accumulated, round, chunk_bits, value);
            schedule.push(key);
        }
        Ok(schedule)
    }
}

/// Split `data` plus a zero terminator into `chunk_bits`-wide values,
/// MSB-first. The final value is zero-padded on the right.
pub fn chunk_values(data: &[u8], chunk_bits: u8) -> Result<Vec<u32>, EncodeError> {
    wire::validate_chunk_bits(chunk_bits)?;
    let width = chunk_bits as u32;
    let total_bits = (data.len() as u32 + 1) * 8;
    let rounds = total_bits.div_ceil(width);

    let bit = |index: u32| -> u32 {
        let byte = data.get((index / 8) as usize).copied().unwrap_or(0);
        (byte >> (7 - index % 8) & 1) as u32
    };

    Ok((0..rounds)
        .map(|r| (0..width).fold(0u32, |acc, i| acc << 1 | bit(r * width + i)))
        .collect())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no valid key for round {round} value {value} in the counter space")]
    KeyExhausted { round: u32, value: u32 },

    #[error("key book has no entry for round {round} value {value}")]
    KeyBookExhausted { round: u32, value: u32 },

    #[error(transparent)]
    Wire(#[from] WireError),
}
