//! /status and /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub messages: usize,
    pub running: usize,
    pub token_loaded: bool,
    pub keybook_loaded: bool,
    pub decrypt_threads: usize,
    pub chunk_bits: u8,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let status = state.coordinator.status();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        messages: status.messages,
        running: status.running,
        token_loaded: status.token_loaded,
        keybook_loaded: status.keybook_loaded,
        decrypt_threads: status.decrypt_threads,
        chunk_bits: state.chunk_bits,
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
