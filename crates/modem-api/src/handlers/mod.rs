//! HTTP API handlers — exposes decoder state as JSON.

pub mod messages;
pub mod status;

use axum::http::StatusCode;

use modem_services::{Coordinator, CoordinatorError};

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Coordinator,
    /// Default chunk width from the config, reported by /status.
    pub chunk_bits: u8,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a device id given as hex, with or without a `0x` prefix.
fn parse_device_id(text: &str) -> Result<u32, (StatusCode, String)> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.is_empty() || digits.len() > 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            "device_id must be 1-8 hex digits".to_string(),
        ));
    }
    u32::from_str_radix(digits, 16)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid hex".to_string()))
}

fn coordinator_error(err: CoordinatorError) -> (StatusCode, String) {
    let status = match &err {
        CoordinatorError::MissingToken | CoordinatorError::MissingKeyBook => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoordinatorError::DuplicateMessage { .. } => StatusCode::CONFLICT,
        CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
        CoordinatorError::Message(_) => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string())
}

// Re-export handler functions for use in router setup.
pub use messages::{handle_get_message, handle_get_reports, handle_list_messages, handle_start_message};
pub use status::{handle_shutdown, handle_status};
