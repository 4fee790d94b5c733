//! HTTP handlers.

use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use switchboard_conversation::SessionSummary;
use switchboard_core::Identity;
use switchboard_integration::{DispatchOutcome, InboundEvent};
use tracing::error;

fn parse_identity(raw: &str) -> Result<Identity, ApiError> {
    raw.parse().map_err(|_| ApiError::InvalidIdentity)
}

/// Receives one channel event and runs (or defers) the turn.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<DispatchOutcome>, ApiError> {
    let outcome = state.dispatcher.handle(event).await.map_err(|report| {
        error!(error = %report, "inbound event failed");
        ApiError::Internal
    })?;
    Ok(Json(outcome))
}

/// Records operator activity for an identity, pausing automated replies.
pub async fn mark_handoff(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = parse_identity(&identity)?;
    state
        .dispatcher
        .gate()
        .mark_active(&identity)
        .await
        .map_err(|report| {
            error!(error = %report, "failed to record operator activity");
            ApiError::Internal
        })?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shows what is stored for an identity.
pub async fn session_summary(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let identity = parse_identity(&identity)?;
    let summary = state
        .dispatcher
        .engine()
        .inspect(&identity)
        .await
        .map_err(|report| {
            error!(error = %report, "failed to read session");
            ApiError::Internal
        })?;
    summary.map(Json).ok_or(ApiError::NotFound)
}

/// Forgets an identity's session, continuation and language.
pub async fn reset_session(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let identity = parse_identity(&identity)?;
    let removed = state
        .dispatcher
        .engine()
        .reset_session(&identity)
        .await
        .map_err(|report| {
            error!(error = %report, "failed to reset session");
            ApiError::Internal
        })?;

    match removed {
        Some(session_id) => Ok(Json(json!({"session_id": session_id}))),
        None => Err(ApiError::NotFound),
    }
}

/// Liveness check.
pub async fn health() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

/// Lists registered tool names.
pub async fn debug_tools(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let names = state.dispatcher.engine().dispatcher().registry().names();
    Json(json!({"tools": names}))
}
