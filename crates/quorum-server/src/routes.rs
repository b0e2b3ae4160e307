//! HTTP control API: session and scope teardown, delegation chain status.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use quorum_core::{DelegationStatus, Scope};

use crate::error::AppError;
use crate::types::AgentRef;
use crate::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/sessions/stop", post(stop_session))
        .route("/scopes/stop-all", post(stop_scope))
        .route("/delegations/:chain_id", get(chain_status))
}

#[derive(Deserialize)]
struct StopSessionRequest {
    agent_ref: AgentRef,
}

async fn stop_session(
    State(state): State<AppState>,
    Json(request): Json<StopSessionRequest>,
) -> Result<Json<Value>, AppError> {
    let key = request
        .agent_ref
        .session_key()
        .map_err(AppError::BadRequest)?;
    state.engine.stop(&key).await;
    Ok(Json(json!({"stopped": key.to_string()})))
}

#[derive(Deserialize)]
struct StopScopeRequest {
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
}

async fn stop_scope(
    State(state): State<AppState>,
    Json(request): Json<StopScopeRequest>,
) -> Result<Json<Value>, AppError> {
    let scope = match (request.project_id, request.room_id) {
        (Some(project), None) => Scope::project(project),
        (None, Some(room)) => Scope::room(room),
        _ => {
            return Err(AppError::BadRequest(
                "exactly one of project_id or room_id is required".to_string(),
            ))
        }
    };
    let stopped = state.engine.stop_all(&scope).await;
    Ok(Json(json!({
        "scope": scope.to_string(),
        "stopped": stopped.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
    })))
}

async fn chain_status(
    State(state): State<AppState>,
    Path(chain_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let statuses = state.engine.coordinator().chain_statuses(&chain_id);
    if statuses.is_empty() {
        return Err(AppError::NotFound(format!("unknown chain {}", chain_id)));
    }
    let records: Vec<Value> = statuses
        .into_iter()
        .map(|(agent_id, status)| {
            let status = match status {
                DelegationStatus::Pending => json!("pending"),
                DelegationStatus::Completed => json!("completed"),
                DelegationStatus::Failed(e) => json!({"failed": e.code()}),
            };
            json!({"agent_id": agent_id, "status": status})
        })
        .collect();
    Ok(Json(json!({"chain_id": chain_id, "records": records})))
}
