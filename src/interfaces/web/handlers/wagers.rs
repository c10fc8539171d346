use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use super::super::AppState;
use crate::core::store::types::{CommitmentStatus, WagerChoice};
use crate::core::wager::{
    CommitOutcome, CommitRejection, Resolution, ResolveOutcome, ResolveRejection,
};

#[derive(serde::Deserialize)]
pub struct CommitRequest {
    requester: String,
    stake: u64,
    choice: String,
}

#[derive(serde::Deserialize)]
pub struct ResolveRequest {
    commitment_id: String,
    deposit_proof: String,
}

#[derive(serde::Deserialize)]
pub struct CancelRequest {
    requester_or_id: String,
}

fn resolution_json(resolution: &Resolution) -> serde_json::Value {
    serde_json::json!({
        "commitment_id": resolution.commitment_id,
        "result": resolution.result,
        "won": resolution.won,
        "payout": resolution.payout,
        "payout_ref": resolution.payout_ref,
        "payout_pending": resolution.payout_pending,
        "secret": resolution.secret,
        "commitment_hash": resolution.commitment_hash,
        "already_resolved": resolution.already_resolved,
    })
}

pub async fn commit_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<CommitRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let requester = payload.requester.trim();
    if requester.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "requester is required" })),
        );
    }
    let Some(choice) = WagerChoice::from_choice(payload.choice.trim()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "choice must be heads or tails" })),
        );
    };

    match state.engine.commit(requester, payload.stake, choice).await {
        Ok(CommitOutcome::Accepted(ticket)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "commitment_id": ticket.commitment_id,
                "commitment_hash": ticket.commitment_hash,
                "deposit": {
                    "address": ticket.deposit_address,
                    "amount": ticket.deposit_amount,
                },
                "expires_at": ticket.expires_at,
            })),
        ),
        Ok(CommitOutcome::Rejected(CommitRejection::InvalidStake { min, max })) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "stake out of bounds",
                "min_stake": min,
                "max_stake": max,
            })),
        ),
        Ok(CommitOutcome::Rejected(CommitRejection::PendingExists { commitment_id })) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "pending commitment exists",
                "commitment_id": commitment_id,
            })),
        ),
        Ok(CommitOutcome::Rejected(CommitRejection::BreakerTripped { reason })) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "circuit breaker", "reason": reason })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

pub async fn resolve_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<ResolveRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if payload.deposit_proof.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "deposit_proof is required" })),
        );
    }
    match state
        .engine
        .resolve(payload.commitment_id.trim(), payload.deposit_proof.trim())
        .await
    {
        Ok(ResolveOutcome::Resolved(resolution)) => {
            // Replays return the original payload under a conflict status so
            // callers can tell a fresh settlement from an idempotent echo.
            let status = if resolution.already_resolved {
                StatusCode::CONFLICT
            } else {
                StatusCode::OK
            };
            (status, Json(resolution_json(&resolution)))
        }
        Ok(ResolveOutcome::Rejected(ResolveRejection::NotFound)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown commitment" })),
        ),
        Ok(ResolveOutcome::Rejected(ResolveRejection::Expired)) => (
            StatusCode::GONE,
            Json(serde_json::json!({ "error": "commitment expired" })),
        ),
        Ok(ResolveOutcome::Rejected(ResolveRejection::VerificationFailed { detail })) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "deposit verification failed",
                "detail": detail,
            })),
        ),
        Ok(ResolveOutcome::Rejected(ResolveRejection::ProofReplayed { holder })) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "deposit proof already consumed",
                "consumed_by": holder,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

pub async fn wager_status_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.engine.commitment(&id).await {
        Ok(Some(commitment)) => {
            let resolved = commitment.status == CommitmentStatus::Resolved;
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "commitment_id": commitment.id,
                    "status": commitment.status,
                    "stake": commitment.stake,
                    "choice": commitment.choice,
                    "commitment_hash": commitment.commitment_hash,
                    "expires_at": commitment.expires_at,
                    "result": commitment.result_choice,
                    "won": commitment.won,
                    "payout": commitment.payout,
                    "payout_pending": commitment.payout_pending,
                    // The secret stays hidden until the outcome is fixed.
                    "secret": if resolved { Some(commitment.secret) } else { None },
                })),
            )
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown commitment" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

pub async fn cancel_wager_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<CancelRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.engine.cancel(payload.requester_or_id.trim()).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "cancelled": cancelled })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

pub async fn pending_review_endpoint(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.unreleased_pending_payouts().await {
        Ok(payouts) => (
            StatusCode::OK,
            Json(serde_json::json!({ "pending": payouts })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
