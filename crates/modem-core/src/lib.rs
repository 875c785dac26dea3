//! modem-core — shared types, key wire layout, bit placement, and the
//! cryptographic primitives of the Find My modem receiver.
//! All other modem crates depend on this one.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod keybook;
pub mod message;
pub mod wire;

pub use auth::AuthToken;
pub use crypto::{key_hash, P224Oracle, ValidityOracle};
pub use keybook::KeyBook;
pub use message::{
    CandidateKey, ChunkOutcome, DecodedByte, DecryptedObservation, KeyHash, Message,
    MessageState, MessageSummary, Observation, Seeding, Termination,
};
