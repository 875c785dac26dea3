//! Key book — pre-shared beacon keypairs, one per (round, value).
//!
//! In the pre-shared seeding strategy the beacon and the receiver share
//! this book ahead of time. The beacon advertises the public key for the
//! value it wants to send in a round; the receiver queries every public key
//! of the round and can decrypt the matching reports with the private half.
//!
//! On disk the book is JSON with base64 keys. Treat the file as secret.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{key_hash, CryptoError, KeyPair, ValidityOracle};
use crate::wire::{self, KeyHash, WireError, ADVERTISED_KEY_LEN};

/// Upper bound on keypairs per book.
pub const MAX_KEYBOOK_ENTRIES: u64 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBookEntry {
    pub round: u32,
    pub value: u32,
    #[serde(with = "b64")]
    private_key: [u8; ADVERTISED_KEY_LEN],
    #[serde(with = "b64")]
    pub public_key: [u8; ADVERTISED_KEY_LEN],
    #[serde(with = "b64")]
    pub hash: KeyHash,
}

impl KeyBookEntry {
    pub fn private_key(&self) -> Zeroizing<[u8; ADVERTISED_KEY_LEN]> {
        Zeroizing::new(self.private_key)
    }
}

impl Drop for KeyBookEntry {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.private_key);
    }
}

/// Round-major table of keypairs: entry `round * 2^chunk_bits + value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBook {
    pub device_id: u32,
    pub chunk_bits: u8,
    pub rounds: u32,
    entries: Vec<KeyBookEntry>,
}

impl KeyBook {
    /// Generate fresh random keypairs for `rounds` rounds.
    pub fn generate(device_id: u32, chunk_bits: u8, rounds: u32) -> Result<Self, KeyBookError> {
        wire::validate_chunk_bits(chunk_bits)?;
        let per_round = wire::value_count(chunk_bits);
        let total = per_round as u64 * rounds as u64;
        if total > MAX_KEYBOOK_ENTRIES {
            return Err(KeyBookError::TooLarge(total));
        }

        let mut entries = Vec::with_capacity(total as usize);
        for round in 0..rounds {
            for value in 0..per_round {
                let pair = KeyPair::generate();
                entries.push(KeyBookEntry {
                    round,
                    value,
                    private_key: *pair.private_bytes(),
                    public_key: pair.public,
                    hash: key_hash(&pair.public),
                });
            }
        }

        Ok(Self {
            device_id,
            chunk_bits,
            rounds,
            entries,
        })
    }

    pub fn lookup(&self, round: u32, value: u32) -> Option<&KeyBookEntry> {
        if round >= self.rounds || value >= wire::value_count(self.chunk_bits) {
            return None;
        }
        let index = round as usize * wire::value_count(self.chunk_bits) as usize + value as usize;
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[KeyBookEntry] {
        &self.entries
    }

    /// Hash → private key map for the decrypt pipeline.
    pub fn private_keys(&self) -> HashMap<KeyHash, Zeroizing<[u8; ADVERTISED_KEY_LEN]>> {
        self.entries
            .iter()
            .map(|e| (e.hash, e.private_key()))
            .collect()
    }

    /// Check that the table is complete and every public key and hash
    /// matches its private key.
    pub fn verify(&self, oracle: &dyn ValidityOracle) -> Result<(), KeyBookError> {
        let expected = wire::value_count(self.chunk_bits) as usize * self.rounds as usize;
        if self.entries.len() != expected {
            return Err(KeyBookError::Incomplete {
                expected,
                found: self.entries.len(),
            });
        }
        for (index, entry) in self.entries.iter().enumerate() {
            let per_round = wire::value_count(self.chunk_bits) as usize;
            let in_place = entry.round as usize == index / per_round
                && entry.value as usize == index % per_round;
            let derived = oracle.derive_public_key(&entry.private_key)?;
            if !in_place || derived != entry.public_key || key_hash(&derived) != entry.hash {
                return Err(KeyBookError::Mismatch {
                    round: entry.round,
                    value: entry.value,
                });
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, KeyBookError> {
        let text = Zeroizing::new(
            std::fs::read_to_string(path)
                .map_err(|e| KeyBookError::ReadFailed(path.to_path_buf(), e))?,
        );
        let book: KeyBook = serde_json::from_str(&text)
            .map_err(|e| KeyBookError::ParseFailed(path.to_path_buf(), e))?;
        wire::validate_chunk_bits(book.chunk_bits)?;
        Ok(book)
    }

    pub fn save(&self, path: &Path) -> Result<(), KeyBookError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KeyBookError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = Zeroizing::new(
            serde_json::to_string_pretty(self).map_err(KeyBookError::SerializeFailed)?,
        );
        std::fs::write(path, text.as_bytes())
            .map_err(|e| KeyBookError::WriteFailed(path.to_path_buf(), e))
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = BASE64.decode(text.trim()).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::custom(format!("expected {N} bytes, got {}", b.len())))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KeyBookError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("key book would hold {0} keypairs, limit is {MAX_KEYBOOK_ENTRIES}")]
    TooLarge(u64),

    #[error("key book has {found} entries, expected {expected}")]
    Incomplete { expected: usize, found: usize },

    #[error("key book entry for round {round} value {value} does not match its private key")]
    Mismatch { round: u32, value: u32 },

    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),

    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),

    #[error("failed to serialize: {0}")]
    SerializeFailed(serde_json::Error),
}
