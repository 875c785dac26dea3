//! /messages handlers — start decodes and read their progress.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use modem_core::message::{DecryptedObservation, MessageSummary};
use modem_services::StartRequest;

use super::{coordinator_error, parse_device_id, ApiState};

// ── /messages (GET) ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageSummary>,
}

pub async fn handle_list_messages(State(state): State<ApiState>) -> Json<MessagesResponse> {
    Json(MessagesResponse {
        messages: state.coordinator.list(),
    })
}

// ── /messages (POST) ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartMessageRequest {
    /// Hex device id, e.g. "0xd3ad0001".
    pub device_id: String,
    #[serde(default)]
    pub chunk_bits: Option<u8>,
    #[serde(default)]
    pub pre_shared: bool,
}

#[derive(Debug, Serialize)]
pub struct StartMessageResponse {
    pub id: u32,
}

pub async fn handle_start_message(
    State(state): State<ApiState>,
    Json(req): Json<StartMessageRequest>,
) -> Result<Json<StartMessageResponse>, (StatusCode, String)> {
    let device_id = parse_device_id(&req.device_id)?;
    let id = state
        .coordinator
        .start(StartRequest {
            device_id,
            chunk_bits: req.chunk_bits,
            pre_shared: req.pre_shared,
        })
        .map_err(coordinator_error)?;
    Ok(Json(StartMessageResponse { id }))
}

// ── /messages/{id} (GET) ──────────────────────────────────────────────────────

pub async fn handle_get_message(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> Result<Json<MessageSummary>, (StatusCode, String)> {
    state
        .coordinator
        .get(id)
        .map(Json)
        .map_err(coordinator_error)
}

// ── /messages/{id}/reports (GET) ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ReportsResponse {
    pub id: u32,
    pub reports: Vec<DecryptedObservation>,
}

pub async fn handle_get_reports(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> Result<Json<ReportsResponse>, (StatusCode, String)> {
    let reports = state.coordinator.reports(id).map_err(coordinator_error)?;
    Ok(Json(ReportsResponse { id, reports }))
}
