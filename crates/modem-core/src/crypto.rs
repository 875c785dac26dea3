//! Cryptographic primitives for the modem.
//!
//! Provides three things:
//!   1. SHA-256 key hashes — the id the report service indexes beacons by
//!   2. The P-224 validity oracle — point validity and public-key derivation
//!   3. Report sealing — ECDH + X9.63 KDF + AES-128-GCM, the format finder
//!      devices use for the location payload of every report
//!
//! Private key material lives in `Zeroizing` buffers and is wiped on drop.
//! There is no unsafe code in this module.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::AesGcm;
use p224::elliptic_curve::sec1::ToEncodedPoint;
use p224::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::wire::{KeyHash, ADVERTISED_KEY_LEN, APPLE_EPOCH_OFFSET_SECS};

/// AES-128-GCM with the 16-byte IV produced by the report KDF.
type ReportCipher = AesGcm<Aes128, U16>;

/// Length of a report payload in the current format.
pub const REPORT_LEN: usize = 88;

/// Uncompressed SEC1 P-224 point.
const EPHEMERAL_KEY_LEN: usize = 57;

/// Latitude/longitude are transmitted in units of 1e-7 degrees.
const COORDINATE_SCALE: f64 = 10_000_000.0;

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Hash an advertised key, returning the 32-byte SHA-256 digest the report
/// service uses as the beacon id.
pub fn key_hash(key: &[u8]) -> KeyHash {
    Sha256::digest(key).into()
}

// ── Validity oracle ───────────────────────────────────────────────────────────

/// Curve boundary consumed by the key encoder and the key book.
///
/// Implementations must be pure: the same input always gives the same answer.
pub trait ValidityOracle: Send + Sync {
    /// Whether `key` is the x-coordinate of a point on the curve.
    fn is_valid(&self, key: &[u8]) -> bool;

    /// Derive the advertised (x-coordinate) public key for a private key.
    fn derive_public_key(&self, private: &[u8]) -> Result<[u8; ADVERTISED_KEY_LEN], CryptoError>;
}

/// The P-224 curve used by crowd-network beacons.
#[derive(Debug, Clone, Copy, Default)]
pub struct P224Oracle;

impl ValidityOracle for P224Oracle {
    fn is_valid(&self, key: &[u8]) -> bool {
        if key.len() != ADVERTISED_KEY_LEN {
            return false;
        }
        // Beacons only broadcast x; any x with a matching y is acceptable,
        // so test the even-y compressed form.
        let mut sec1 = [0u8; ADVERTISED_KEY_LEN + 1];
        sec1[0] = 0x02;
        sec1[1..].copy_from_slice(key);
        PublicKey::from_sec1_bytes(&sec1).is_ok()
    }

    fn derive_public_key(&self, private: &[u8]) -> Result<[u8; ADVERTISED_KEY_LEN], CryptoError> {
        let secret = SecretKey::from_slice(private).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(x_coordinate(&secret.public_key()))
    }
}

fn x_coordinate(public: &PublicKey) -> [u8; ADVERTISED_KEY_LEN] {
    let point = public.to_encoded_point(true);
    let mut out = [0u8; ADVERTISED_KEY_LEN];
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

fn public_from_advertised(key: &[u8]) -> Result<PublicKey, CryptoError> {
    if key.len() != ADVERTISED_KEY_LEN {
        return Err(CryptoError::InvalidPublicKey);
    }
    let mut sec1 = [0u8; ADVERTISED_KEY_LEN + 1];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(key);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A pre-shared beacon keypair.
///
/// The private key never leaves this struct except through
/// `private_bytes`, which hands out a zeroizing copy.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    private: Zeroizing<[u8; ADVERTISED_KEY_LEN]>,
    /// Advertised public key (x-coordinate).
    pub public: [u8; ADVERTISED_KEY_LEN],
}

impl KeyPair {
    /// Generate a fresh random P-224 keypair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        Self {
            private: Zeroizing::new(secret.to_bytes().into()),
            public: x_coordinate(&secret.public_key()),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; ADVERTISED_KEY_LEN]> {
        Zeroizing::new(*self.private)
    }
}

/// Convenience wrapper mirroring `KeyPair::generate`.
pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

// ── Report sealing ────────────────────────────────────────────────────────────

/// Decrypted content of one crowd-sourced report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    /// Unix seconds at which the finder saw the beacon.
    pub timestamp: u64,
    pub confidence: u8,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: u8,
    pub status: u8,
}

/// ANSI X9.63 KDF, single SHA-256 block:
///   SHA256(shared || 00000001 || ephemeral)
/// First half is the AES key, second half the IV.
fn derive_report_key(shared: &[u8], ephemeral: &[u8]) -> Zeroizing<[u8; 32]> {
    let digest: [u8; 32] = Sha256::new()
        .chain_update(shared)
        .chain_update(1u32.to_be_bytes())
        .chain_update(ephemeral)
        .finalize()
        .into();
    Zeroizing::new(digest)
}

/// Decrypt a report payload with the private key of the beacon it was
/// filed under.
///
/// The newer 89-byte form carries an extra byte at index 4 which is
/// dropped before parsing.
pub fn decrypt_report(private: &[u8], payload: &[u8]) -> Result<LocationReport, CryptoError> {
    let mut data = payload.to_vec();
    if data.len() > REPORT_LEN {
        data.remove(4);
    }
    if data.len() != REPORT_LEN {
        return Err(CryptoError::MalformedReport(payload.len()));
    }

    let seconds = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let confidence = data[4];
    let ephemeral = &data[5..5 + EPHEMERAL_KEY_LEN];
    let sealed = &data[5 + EPHEMERAL_KEY_LEN..];

    let secret = SecretKey::from_slice(private).map_err(|_| CryptoError::InvalidPrivateKey)?;
    let ephemeral_key =
        PublicKey::from_sec1_bytes(ephemeral).map_err(|_| CryptoError::InvalidEphemeralKey)?;
    let shared = p224::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral_key.as_affine());
    let derived = derive_report_key(shared.raw_secret_bytes(), ephemeral);

    let cipher = ReportCipher::new(GenericArray::from_slice(&derived[..16]));
    let plain = cipher
        .decrypt(GenericArray::from_slice(&derived[16..]), sealed)
        .map_err(|_| CryptoError::DecryptFailed)?;
    if plain.len() < 10 {
        return Err(CryptoError::DecryptFailed);
    }

    let latitude = i32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
    let longitude = i32::from_be_bytes([plain[4], plain[5], plain[6], plain[7]]);

    Ok(LocationReport {
        timestamp: seconds + APPLE_EPOCH_OFFSET_SECS,
        confidence,
        latitude: latitude as f64 / COORDINATE_SCALE,
        longitude: longitude as f64 / COORDINATE_SCALE,
        accuracy: plain[8],
        status: plain[9],
    })
}

/// Seal a location for an advertised key the way a finder device does.
///
/// Receivers never call this; it exists for simulation and fixtures.
pub fn encrypt_report(advertised: &[u8], report: &LocationReport) -> Result<Vec<u8>, CryptoError> {
    let target = public_from_advertised(advertised)?;

    let ephemeral_secret = SecretKey::random(&mut OsRng);
    let ephemeral = ephemeral_secret.public_key().to_encoded_point(false);
    let shared = p224::ecdh::diffie_hellman(ephemeral_secret.to_nonzero_scalar(), target.as_affine());
    let derived = derive_report_key(shared.raw_secret_bytes(), ephemeral.as_bytes());

    let mut plain = [0u8; 10];
    plain[..4].copy_from_slice(&((report.latitude * COORDINATE_SCALE).round() as i32).to_be_bytes());
    plain[4..8].copy_from_slice(&((report.longitude * COORDINATE_SCALE).round() as i32).to_be_bytes());
    plain[8] = report.accuracy;
    plain[9] = report.status;

    let cipher = ReportCipher::new(GenericArray::from_slice(&derived[..16]));
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&derived[16..]), plain.as_slice())
        .map_err(|_| CryptoError::EncryptFailed)?;

    let seconds = report.timestamp.saturating_sub(APPLE_EPOCH_OFFSET_SECS) as u32;
    let mut out = Vec::with_capacity(REPORT_LEN);
    out.extend_from_slice(&seconds.to_be_bytes());
    out.push(report.confidence);
    out.extend_from_slice(ephemeral.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("private key is not a valid P-224 scalar")]
    InvalidPrivateKey,

    #[error("public key is not on the curve")]
    InvalidPublicKey,

    #[error("report carries an invalid ephemeral key")]
    InvalidEphemeralKey,

    #[error("report payload has unexpected length {0}")]
    MalformedReport(usize),

    #[error("report authentication failed")]
    DecryptFailed,

    #[error("report sealing failed")]
    EncryptFailed,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
