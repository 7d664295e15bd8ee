use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use folio_authz::Identity;
use folio_events::{Action, Entity, MutationRecord, RecordError, RelayError};
use folio_http::AppError;

use super::apply::RecordApplier;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub queued: bool,
}

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub applied: usize,
}

fn relay_error(error: RelayError) -> AppError {
    match error {
        RelayError::ChannelUnavailable(e) => {
            AppError::unavailable("channel_unavailable", format!("queue channel unavailable: {}", e))
        }
        other => AppError::Internal(other.into()),
    }
}

/// Turn a send request into a record, or explain what is wrong with it.
fn build_record(request: SendRequest, submitted_by: &str) -> Result<MutationRecord, AppError> {
    let (entity, action) = match (request.entity, request.action) {
        (Some(entity), Some(action)) if !entity.is_empty() && !action.is_empty() => {
            (entity, action)
        }
        _ => return Err(AppError::bad_request("entity and action required")),
    };

    let mut details = Vec::new();
    let entity = entity.parse::<Entity>().map_err(|e| {
        details.push(json!({ "field": "entity", "error": e.to_string() }));
    });
    let action = action.parse::<Action>().map_err(|e| {
        details.push(json!({ "field": "action", "error": e.to_string() }));
    });
    let data = request.data.unwrap_or_else(|| json!({}));
    if !data.is_object() {
        details.push(json!({ "field": "data", "error": "must be an object" }));
    }

    let (Ok(entity), Ok(action)) = (entity, action) else {
        return Err(AppError::validation(details, "invalid mutation"));
    };
    if !details.is_empty() {
        return Err(AppError::validation(details, "invalid mutation"));
    }

    MutationRecord::new(entity, action, data, submitted_by).map_err(|e| match e {
        RecordError::MissingTarget { .. } => AppError::validation(
            vec![json!({ "field": "data._id", "error": "required" })],
            e.to_string(),
        ),
    })
}

/// Enqueue one mutation for later application
pub async fn send(
    identity: Identity,
    State(state): State<AppState>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::bad_request(e.body_text()))?;
    let record = build_record(request, &identity.username)?;

    state.relay.enqueue(&record).await.map_err(relay_error)?;
    Ok(Json(SendResponse { queued: true }))
}

/// Drain the queue once and apply what arrives within the window
pub async fn apply(
    identity: Identity,
    State(state): State<AppState>,
) -> Result<Json<ApplyResponse>, AppError> {
    tracing::info!(requested_by = %identity.username, "drain requested");

    let applier = RecordApplier::new(state.store.clone());
    let report = state.relay.drain(&applier).await.map_err(relay_error)?;
    Ok(Json(ApplyResponse {
        applied: report.applied,
    }))
}
