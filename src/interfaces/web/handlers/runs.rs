use axum::{Json, extract::State, http::StatusCode};

use super::super::AppState;
use crate::core::pipeline::{CancelOutcome, StartOutcome};
use crate::core::store::types::{Phase, Run};

#[derive(serde::Deserialize, Default)]
pub struct StartRunRequest {
    #[serde(default)]
    force: bool,
}

fn run_json(run: &Run) -> serde_json::Value {
    let phase_name = Phase::from_index(run.phase)
        .map(|p| p.as_str())
        .unwrap_or("done");
    serde_json::json!({
        "id": run.id,
        "status": run.status,
        "active": run.status.is_active(),
        "phase": run.phase,
        "phase_name": phase_name,
        "slug": run.slug,
        "name": run.name,
        "description": run.description,
        "deploy_url": run.deploy_url,
        "demo_mode": run.demo_mode,
        "error": run.error,
        "created_at": run.created_at,
        "ended_at": run.ended_at,
    })
}

pub async fn start_run_endpoint(
    State(state): State<AppState>,
    payload: Option<Json<StartRunRequest>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let force = payload.map(|Json(p)| p.force).unwrap_or(false);
    match state.orchestrator.start(force).await {
        Ok(StartOutcome::Started { run_id }) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "run_id": run_id })),
        ),
        Ok(StartOutcome::AlreadyActive { run_id }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "already-active",
                "run_id": run_id,
            })),
        ),
        Ok(StartOutcome::CoolingDown { remaining_ms }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "cooling-down",
                "retry_after_ms": remaining_ms,
            })),
        ),
        Ok(StartOutcome::DailyCapReached { cap }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "daily-cap-reached",
                "cap": cap,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

pub async fn cancel_run_endpoint(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.orchestrator.cancel().await {
        Ok(CancelOutcome::Cancelled(run)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "run": run_json(&run) })),
        ),
        Ok(CancelOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no active run" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

pub async fn run_status_endpoint(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.orchestrator.status().await {
        Ok(Some(run)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "run": run_json(&run) })),
        ),
        Ok(None) => (
            StatusCode::OK,
            Json(serde_json::json!({ "run": serde_json::Value::Null })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
