//! API route handlers.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use leech_core::{
    parse_history, CapturedRequest, Command, CommandResponse, HistoryFile, NetworkEvent, BADGE_COLOR,
};

use crate::error::{ApiError, Result};
use crate::models::{AckResponse, BadgeResponse, SitesResponse};
use crate::state::AppState;

/// POST /api/message - Relay a command to the engine.
pub async fn post_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<CommandResponse>> {
    let command: Command = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("unknown or malformed command: {e}")))?;

    debug!(action = command.action(), "Command received");

    let response = state.engine.command(command).await?;
    Ok(Json(response))
}

/// POST /api/events - Deliver a network or tab event.
pub async fn post_event(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<AckResponse>> {
    let event: NetworkEvent = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("malformed event: {e}")))?;

    state.engine.send_event(event)?;
    Ok(Json(AckResponse::ok()))
}

/// GET /api/badge - Current badge for the active tab.
pub async fn get_badge(State(state): State<AppState>) -> Json<BadgeResponse> {
    Json(BadgeResponse {
        text: state.badge.text(),
        count: state.badge.count(),
        color: BADGE_COLOR,
    })
}

/// GET /api/history - Export the full store as a history document.
pub async fn get_history(State(state): State<AppState>) -> Result<Json<HistoryFile>> {
    let requests = export_records(&state).await?;
    Ok(Json(HistoryFile::new(requests, Utc::now())))
}

/// POST /api/history - Replace the store with an imported history document.
pub async fn post_history(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<CommandResponse>> {
    let records = parse_history(body)?;
    let response = state
        .engine
        .command(Command::ImportHistory {
            requests: Some(Value::Array(records)),
        })
        .await?;
    Ok(Json(response))
}

/// GET /api/sites - Registered site extractors.
pub async fn list_sites(State(state): State<AppState>) -> Json<SitesResponse> {
    Json(SitesResponse {
        sites: state.extractors.names(),
    })
}

/// GET /api/sites/{name} - Entities of one site, derived from the store.
pub async fn get_site(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let site = state
        .extractors
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("site {name}")))?;
    let records = export_records(&state).await?;

    debug!(site = name, records = records.len(), "Summarizing site");
    Ok(Json(site.summarize(&records)))
}

async fn export_records(state: &AppState) -> Result<Vec<CapturedRequest>> {
    match state.engine.command(Command::GetRequestsForExport).await? {
        CommandResponse::Requests { requests } => Ok(requests),
        other => Err(ApiError::Internal(format!(
            "unexpected export reply: {other:?}"
        ))),
    }
}
