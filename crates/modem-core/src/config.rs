//! Configuration system for the modem receiver.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MODEM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/findmy-modem/config.toml
//!   3. ~/.config/findmy-modem/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::{self, Keystream, WireError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub decode: DecodeConfig,
    pub fetch: FetchConfig,
    pub keys: KeysConfig,
    pub decrypt: DecryptConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Bits carried per round, 1..=16.
    pub chunk_bits: u8,
    /// Keystream pattern as hex, cycled to the payload window.
    pub keystream: String,
    /// Rounds before a message is abandoned.
    pub max_rounds: u32,
    /// Consecutive silent bytes that end a message. 0 = never.
    pub silence_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Report gateway URL. Receives the POSTed search query.
    pub endpoint: String,
    /// File holding the search-party token.
    pub token_path: PathBuf,
    /// How far back each query looks.
    pub lookback_secs: u64,
    /// Per-query timeout; a stalled query counts as zero reports.
    pub timeout_secs: u64,
    /// Hashes per concurrent query. 0 = one query per round.
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Pre-shared key book. Only used by pre-shared messages.
    pub keybook_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptConfig {
    /// Decrypt worker threads. 0 = available parallelism.
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            chunk_bits: 8,
            keystream: hex::encode(Keystream::default().window()),
            max_rounds: 4096,
            silence_limit: 2,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:6176/acsnservice/fetch".into(),
            token_path: config_dir().join("token"),
            lookback_secs: 86_400,
            timeout_secs: 30,
            batch_size: 0,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            keybook_path: data_dir().join("keybook.json"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9101 }
    }
}

impl DecodeConfig {
    /// Parsed keystream pattern.
    pub fn keystream(&self) -> Result<Keystream, WireError> {
        Keystream::from_hex(&self.keystream)
    }

    pub fn validate(&self) -> Result<(), WireError> {
        wire::validate_chunk_bits(self.chunk_bits)?;
        self.keystream().map(|_| ())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("findmy-modem")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("findmy-modem")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid decode settings: {0}")]
    Invalid(#[from] WireError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ModemConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ModemConfig::default()
        };
        config.apply_env_overrides();
        config.decode.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MODEM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ModemConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MODEM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(var("MODEM_DECODE__CHUNK_BITS")) {
            self.decode.chunk_bits = v;
        }
        if let Some(v) = parsed(var("MODEM_DECODE__MAX_ROUNDS")) {
            self.decode.max_rounds = v;
        }
        if let Some(v) = parsed(var("MODEM_DECODE__SILENCE_LIMIT")) {
            self.decode.silence_limit = v;
        }
        if let Some(v) = var("MODEM_FETCH__ENDPOINT") {
            self.fetch.endpoint = v;
        }
        if let Some(v) = var("MODEM_FETCH__TOKEN_PATH") {
            self.fetch.token_path = PathBuf::from(v);
        }
        if let Some(v) = parsed(var("MODEM_FETCH__TIMEOUT_SECS")) {
            self.fetch.timeout_secs = v;
        }
        if let Some(v) = parsed(var("MODEM_DECRYPT__THREADS")) {
            self.decrypt.threads = v;
        }
        if let Some(v) = parsed(var("MODEM_API__PORT")) {
            self.api.port = v;
        }
    }
}
