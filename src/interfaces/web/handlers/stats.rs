use axum::{Json, extract::State, http::StatusCode};

use super::super::AppState;
use crate::core::store::types::WalletTier;
use crate::core::store::{day_key, now_ms};

pub async fn health_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn stats_endpoint(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let now = now_ms();
    // Best-effort live refresh; stale snapshots still render with their
    // original synced_at so staleness is visible.
    let _ = state.wallets.sync_snapshots().await;
    let counters = match state.store.counters_for_day(&day_key(now)).await {
        Ok(counters) => counters,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            );
        }
    };

    let mut wallets = serde_json::Map::new();
    for tier in [WalletTier::Reserve, WalletTier::Hot, WalletTier::Airlock] {
        if let Ok(Some(snapshot)) = state.store.wallet_snapshot(tier).await {
            wallets.insert(
                tier.as_str().to_string(),
                serde_json::json!({
                    "balance": snapshot.balance,
                    "synced_at": snapshot.synced_at,
                }),
            );
        }
    }

    let pending = state
        .store
        .unreleased_pending_payouts()
        .await
        .map(|p| p.len())
        .unwrap_or(0);

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "day": counters.day,
            "runs_shipped": counters.runs_shipped,
            "last_run_end": counters.last_run_end,
            "total_wagered": counters.total_wagered,
            "total_payout": counters.total_payout,
            "net_loss": counters.net_loss(),
            "wins": counters.wins,
            "losses": counters.losses,
            "pending_payouts": pending,
            "wallets": wallets,
        })),
    )
}

pub async fn limits_endpoint(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let now = now_ms();
    let run_gate = state.limiter.can_run(now).await;
    let announce_gate = state.limiter.can_announce(now).await;
    match (run_gate, announce_gate) {
        (Ok(run), Ok(announce)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "run": run,
                "announce": announce,
                "wager": {
                    "min_stake": state.wager_config.min_stake,
                    "max_stake": state.wager_config.max_stake,
                    "daily_loss_cap": state.wager_config.daily_loss_cap,
                    "payout_cap_per_tx": state.wager_config.payout_cap_per_tx,
                },
            })),
        ),
        (Err(e), _) | (_, Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
