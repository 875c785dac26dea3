//! Search-party token — the opaque capability the report service requires.
//!
//! Acquisition and refresh are the caller's business. The modem only
//! carries the bytes to the report source and never logs them.

use std::fmt;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Clone)]
pub struct AuthToken(Zeroizing<Vec<u8>>);

impl AuthToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, AuthError> {
        if bytes.is_empty() {
            return Err(AuthError::Empty);
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Load a token file. Base64 text is decoded; anything else is taken
    /// verbatim (minus surrounding whitespace).
    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let text = Zeroizing::new(
            std::fs::read_to_string(path)
                .map_err(|e| AuthError::ReadFailed(path.to_path_buf(), e))?,
        );
        let trimmed = text.trim();
        match BASE64.decode(trimmed) {
            Ok(bytes) => Self::from_bytes(bytes),
            Err(_) => Self::from_bytes(trimmed.as_bytes().to_vec()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(&*self.0))
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(<{} bytes>)", self.0.len())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read token from {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("token is empty")]
    Empty,
}
