//! Report sources — where observations for a set of key hashes come from.
//!
//! `HttpReportSource` POSTs a search query to a report gateway that fronts
//! the crowd network. `StaticReportSource` replays a saved report
//! dictionary, which is how decoding is re-run offline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;

use modem_core::auth::AuthToken;
use modem_core::message::{KeyHash, Observation};
use modem_core::wire::{self, ReportQuery, ReportResults, ReportSearch};

/// Publication window of a query, in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl QueryWindow {
    /// From `lookback` ago until now.
    pub fn lookback(lookback: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            start_ms: now.saturating_sub(lookback.as_millis() as u64),
            end_ms: now,
        }
    }

    pub fn contains(&self, ms: u64) -> bool {
        (self.start_ms..=self.end_ms).contains(&ms)
    }
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Every report filed under any of `hashes` within `window`.
    async fn query(
        &self,
        hashes: &[KeyHash],
        window: QueryWindow,
        token: &AuthToken,
    ) -> Result<Vec<Observation>, FetchError>;
}

/// Convert service records, skipping any that do not parse.
pub fn observations_from(results: &ReportResults) -> Vec<Observation> {
    results
        .results
        .iter()
        .filter_map(|record| match Observation::from_record(record) {
            Ok(obs) => Some(obs),
            Err(e) => {
                tracing::debug!(id = %record.id, error = %e, "skipping malformed report");
                None
            }
        })
        .collect()
}

// ── HTTP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpReportSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReportSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ReportSource for HttpReportSource {
    async fn query(
        &self,
        hashes: &[KeyHash],
        window: QueryWindow,
        token: &AuthToken,
    ) -> Result<Vec<Observation>, FetchError> {
        let body = ReportQuery {
            search: vec![ReportSearch {
                start_date: window.start_ms,
                end_date: window.end_ms,
                ids: hashes.iter().map(wire::encode_hash).collect(),
            }],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token.to_base64().as_str())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let results: ReportResults = resp.json().await?;
        tracing::debug!(
            hashes = hashes.len(),
            records = results.results.len(),
            "report query complete"
        );
        Ok(observations_from(&results))
    }
}

// ── Static ────────────────────────────────────────────────────────────────────

/// Fixed set of observations, filtered per query.
#[derive(Debug, Clone, Default)]
pub struct StaticReportSource {
    observations: Vec<Observation>,
}

impl StaticReportSource {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn from_results(results: &ReportResults) -> Self {
        Self::new(observations_from(results))
    }

    /// Load a saved `{"results": [...]}` dictionary.
    pub fn load(path: &Path) -> Result<Self, FetchError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FetchError::ReadFailed(path.to_path_buf(), e))?;
        let results: ReportResults = serde_json::from_str(&text)?;
        Ok(Self::from_results(&results))
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

#[async_trait]
impl ReportSource for StaticReportSource {
    async fn query(
        &self,
        hashes: &[KeyHash],
        window: QueryWindow,
        _token: &AuthToken,
    ) -> Result<Vec<Observation>, FetchError> {
        let wanted: HashSet<&KeyHash> = hashes.iter().collect();
        Ok(self
            .observations
            .iter()
            .filter(|o| wanted.contains(&o.key_hash) && window.contains(o.date_published))
            .cloned()
            .collect())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("report request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("report service returned status {0}")]
    Status(u16),

    #[error("report query timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse reports: {0}")]
    Parse(#[from] serde_json::Error),
}
