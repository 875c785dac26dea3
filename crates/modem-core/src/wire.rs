//! Modem wire format — the advertised key layout, the payload window, and
//! the JSON records exchanged with the crowd-sourced report service.
//!
//! The advertised key layout IS the protocol between a beacon and the
//! receiver. Every byte of `AdvertisedKey` is bit-exact with what the
//! firmware broadcasts; changing anything here breaks decoding of every
//! message already in flight.
//!
//! Layout (28 bytes, the x-coordinate of a compressed P-224 point):
//!   [2-byte prefix BA BE] [4-byte device id BE] [2-byte nonce BE] [20-byte payload]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Fixed magic prefix of every advertised key.
pub const KEY_PREFIX: [u8; 2] = [0xBA, 0xBE];

/// Advertised key length: a P-224 x-coordinate.
pub const ADVERTISED_KEY_LEN: usize = 28;

/// Payload window length in bytes.
pub const PAYLOAD_LEN: usize = 20;

/// Payload window length in bits.
pub const WINDOW_BITS: u32 = (PAYLOAD_LEN * 8) as u32;

/// Widest chunk a single round can carry.
pub const MAX_CHUNK_BITS: u8 = 16;

/// Repeating pattern of the default keystream.
pub const DEFAULT_KEYSTREAM_PATTERN: [u8; 4] = [0x7a, 0x6a, 0x10, 0x26];

/// Seconds between the Unix epoch and 2001-01-01, the epoch used inside
/// report payloads.
pub const APPLE_EPOCH_OFFSET_SECS: u64 = 978_307_200;

/// SHA-256 digest of an advertised key; the report service's lookup id.
pub type KeyHash = [u8; 32];

// ── Advertised key ────────────────────────────────────────────────────────────

/// One advertised key as broadcast by a beacon.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AdvertisedKey {
    /// Always `KEY_PREFIX`.
    pub prefix: [u8; 2],
    /// Sending device id, big-endian.
    pub device_id: [u8; 4],
    /// Rejection-sampling nonce, big-endian. Carries no data.
    pub counter: [u8; 2],
    /// Keystream XOR accumulated chunk window.
    pub payload: [u8; PAYLOAD_LEN],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(AdvertisedKey, [u8; ADVERTISED_KEY_LEN]);

impl AdvertisedKey {
    pub fn new(device_id: u32, counter: u16, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            prefix: KEY_PREFIX,
            device_id: device_id.to_be_bytes(),
            counter: counter.to_be_bytes(),
            payload,
        }
    }

    /// Parse a 28-byte advertised key. Returns `None` on a length mismatch.
    pub fn read(bytes: &[u8]) -> Option<Self> {
        Self::read_from(bytes)
    }

    pub fn to_array(&self) -> [u8; ADVERTISED_KEY_LEN] {
        let mut out = [0u8; ADVERTISED_KEY_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }

    pub fn device_id(&self) -> u32 {
        u32::from_be_bytes(self.device_id)
    }

    pub fn counter(&self) -> u16 {
        u16::from_be_bytes(self.counter)
    }
}

// ── Keystream ─────────────────────────────────────────────────────────────────

/// Pre-shared byte pattern XORed over the payload window so that the
/// broadcast keys do not expose the raw data layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keystream([u8; PAYLOAD_LEN]);

impl Default for Keystream {
    fn default() -> Self {
        let mut window = [0u8; PAYLOAD_LEN];
        for (i, b) in window.iter_mut().enumerate() {
            *b = DEFAULT_KEYSTREAM_PATTERN[i % DEFAULT_KEYSTREAM_PATTERN.len()];
        }
        Self(window)
    }
}

impl Keystream {
    /// Cycle (or truncate) `pattern` to the window length.
    pub fn from_pattern(pattern: &[u8]) -> Result<Self, WireError> {
        if pattern.is_empty() {
            return Err(WireError::EmptyKeystream);
        }
        let mut window = [0u8; PAYLOAD_LEN];
        for (i, b) in window.iter_mut().enumerate() {
            *b = pattern[i % pattern.len()];
        }
        Ok(Self(window))
    }

    pub fn from_hex(text: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(text.trim()).map_err(|_| WireError::InvalidHex)?;
        Self::from_pattern(&bytes)
    }

    pub fn window(&self) -> &[u8; PAYLOAD_LEN] {
        &self.0
    }

    /// XOR the keystream over an accumulated window.
    pub fn apply(&self, window: &[u8; PAYLOAD_LEN]) -> [u8; PAYLOAD_LEN] {
        let mut out = *window;
        for (o, k) in out.iter_mut().zip(self.0.iter()) {
            *o ^= k;
        }
        out
    }
}

// ── Bit placement ─────────────────────────────────────────────────────────────

pub fn validate_chunk_bits(chunk_bits: u8) -> Result<(), WireError> {
    if chunk_bits == 0 || chunk_bits > MAX_CHUNK_BITS {
        return Err(WireError::InvalidChunkBits(chunk_bits));
    }
    Ok(())
}

/// Number of distinct chunk values per round.
pub fn value_count(chunk_bits: u8) -> u32 {
    1u32 << chunk_bits
}

fn chunk_mask(chunk_bits: u8) -> u32 {
    value_count(chunk_bits) - 1
}

/// Number of chunk slots in the window before positions wrap.
pub fn slot_count(chunk_bits: u8) -> u32 {
    WINDOW_BITS / chunk_bits as u32
}

/// Bit offset of a round's slot, counted from the least significant bit of
/// the last window byte.
pub fn bit_offset(round: u32, chunk_bits: u8) -> u32 {
    chunk_bits as u32 * (round % slot_count(chunk_bits))
}

/// XOR `value` into the window at the slot for `round`.
///
/// A slot may straddle up to three bytes (16-bit chunk at a non-zero bit
/// offset), so the shifted value is split byte by byte from the low end.
pub fn place_chunk(window: &mut [u8; PAYLOAD_LEN], round: u32, chunk_bits: u8, value: u32) {
    let offset = bit_offset(round, chunk_bits);
    let shifted = (value & chunk_mask(chunk_bits)) << (offset % 8);
    let first = (offset / 8) as usize;
    for k in 0..3 {
        let from_end = first + k;
        if from_end >= PAYLOAD_LEN {
            break;
        }
        window[PAYLOAD_LEN - 1 - from_end] ^= (shifted >> (8 * k)) as u8;
    }
}

/// Read the value at the slot for `round`. Inverse of `place_chunk` on a
/// window whose slot was zero before placement.
pub fn extract_chunk(window: &[u8; PAYLOAD_LEN], round: u32, chunk_bits: u8) -> u32 {
    let offset = bit_offset(round, chunk_bits);
    let first = (offset / 8) as usize;
    let mut gathered = 0u32;
    for k in 0..3 {
        let from_end = first + k;
        if from_end >= PAYLOAD_LEN {
            break;
        }
        gathered |= (window[PAYLOAD_LEN - 1 - from_end] as u32) << (8 * k);
    }
    (gathered >> (offset % 8)) & chunk_mask(chunk_bits)
}

// ── Hash ids ──────────────────────────────────────────────────────────────────

/// Base64 form used as the report service id.
pub fn encode_hash(hash: &KeyHash) -> String {
    BASE64.encode(hash)
}

pub fn decode_hash(text: &str) -> Result<KeyHash, WireError> {
    let bytes = BASE64
        .decode(text.trim())
        .map_err(|_| WireError::InvalidBase64)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| WireError::BadHashLength(b.len()))
}

// ── Report service records ───────────────────────────────────────────────────

/// Query body for the report service: one search per hash batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportQuery {
    pub search: Vec<ReportSearch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSearch {
    /// Unix milliseconds.
    pub start_date: u64,
    /// Unix milliseconds.
    pub end_date: u64,
    /// Base64 key hashes.
    pub ids: Vec<String>,
}

/// One crowd-sourced report as returned by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    /// Base64 key hash this report was filed under.
    pub id: String,
    /// Unix milliseconds.
    pub date_published: u64,
    /// Base64 encrypted location payload.
    pub payload: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status_code: Option<i64>,
}

/// Top-level service response, also the on-disk report dictionary format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportResults {
    #[serde(default)]
    pub results: Vec<ReportRecord>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("chunk width must be 1..={MAX_CHUNK_BITS} bits, got {0}")]
    InvalidChunkBits(u8),

    #[error("keystream must not be empty")]
    EmptyKeystream,

    #[error("invalid hex")]
    InvalidHex,

    #[error("invalid base64")]
    InvalidBase64,

    #[error("key hash must be 32 bytes, got {0}")]
    BadHashLength(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
