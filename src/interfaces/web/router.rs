use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{runs, stats, wagers};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    let api_port = state.api_port;
    // Run control is operator-only once a token is configured.
    let operator_routes = Router::new()
        .route("/run", post(runs::start_run_endpoint))
        .route("/run/cancel", post(runs::cancel_run_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_operator,
        ))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/health", get(stats::health_endpoint))
        .route("/run/status", get(runs::run_status_endpoint))
        .route("/wager/commit", post(wagers::commit_endpoint))
        .route("/wager/resolve", post(wagers::resolve_endpoint))
        .route("/wager/status/{id}", get(wagers::wager_status_endpoint))
        .route("/wager/cancel", post(wagers::cancel_wager_endpoint))
        .route(
            "/wager/pending-review",
            get(wagers::pending_review_endpoint),
        )
        .route("/stats", get(stats::stats_endpoint))
        .route("/limits", get(stats::limits_endpoint))
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    operator_routes
        .merge(public_routes)
        .layer(build_localhost_cors(api_port))
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{AnnouncerConfig, PipelineConfig, WagerConfig, WalletConfig};
    use crate::core::limits::RateLimiter;
    use crate::core::pipeline::collaborators::{
        BuildOutput, Builder, DeployOutput, Deployer, GamePlan, StaticPlanner,
    };
    use crate::core::pipeline::{Collaborators, PipelineOrchestrator};
    use crate::core::store::StateStore;
    use crate::core::supervisor::ProcessSupervisor;
    use crate::core::wager::testing::MockLedger;
    use crate::core::wager::{CommitRevealEngine, WalletTierManager};
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    /// Builder that holds the run active long enough for conflict tests.
    struct SleepyBuilder;

    #[async_trait]
    impl Builder for SleepyBuilder {
        async fn build(&self, plan: &GamePlan, _pid_tx: mpsc::Sender<u32>) -> Result<BuildOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(BuildOutput {
                artifact_ref: format!("builds/{}", plan.slug),
            })
        }
    }

    struct OkDeployer;

    #[async_trait]
    impl Deployer for OkDeployer {
        async fn deploy(&self, _artifact_ref: &str, slug: &str) -> Result<DeployOutput> {
            Ok(DeployOutput {
                url: format!("https://games.test/{}", slug),
            })
        }

        async fn verify(&self, _url: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct Harness {
        state: AppState,
        ledger: Arc<MockLedger>,
    }

    fn harness_with_token(internal_token: Option<String>) -> Harness {
        let store = Arc::new(StateStore::open_in_memory());
        let ledger = Arc::new(MockLedger::with_balance("hot", 1_000_000_000_000));
        let pipeline_config = PipelineConfig {
            max_runs_per_day: 10,
            cooldown_ms: 60 * 60 * 1000,
            auto_run_cron: None,
            calibrate_attempts: 1,
            calibrate_backoff_ms: 1,
            builder_process_name: "gameforge-test-no-such-tool".to_string(),
        };
        let wager_config = WagerConfig {
            min_stake: 10,
            max_stake: 1_000_000,
            payout_multiplier_bps: 19_400,
            commitment_ttl_ms: 120_000,
            daily_loss_cap: u64::MAX,
            payout_cap_per_tx: u64::MAX,
            hot_spend_cap_bps: 10_000,
        };
        let wallet_config = WalletConfig {
            reserve_address: "rsv".to_string(),
            hot_address: "hot".to_string(),
            airlock_address: "air".to_string(),
            burn_address: "burn".to_string(),
            ..Default::default()
        };

        let supervisor = Arc::new(ProcessSupervisor::new(
            store.clone(),
            pipeline_config.builder_process_name.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            pipeline_config.clone(),
            AnnouncerConfig::default(),
        ));
        let wallets = Arc::new(WalletTierManager::new(
            store.clone(),
            ledger.clone(),
            wallet_config,
        ));
        let (log_tx, _) = tokio::sync::broadcast::channel(16);

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            pipeline_config,
            Collaborators {
                planner: Arc::new(StaticPlanner),
                builder: Arc::new(SleepyBuilder),
                deployer: Arc::new(OkDeployer),
                renderer: None,
                announcer: None,
                chain: None,
            },
            supervisor,
            limiter.clone(),
            wallets.clone(),
            log_tx.clone(),
        ));
        let engine = Arc::new(CommitRevealEngine::new(
            store.clone(),
            ledger.clone(),
            wallets.clone(),
            wager_config.clone(),
        ));

        Harness {
            state: AppState {
                store,
                orchestrator,
                engine,
                limiter,
                wallets,
                wager_config,
                log_tx,
                api_port: 17950,
                internal_token,
            },
            ledger,
        }
    }

    fn harness() -> Harness {
        harness_with_token(None)
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(path);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_string(&json).unwrap())
            }
            None => Body::empty(),
        };
        let req = builder.body(body).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let h = harness();
        let app = build_api_router(h.state);
        let (status, json) = json_request(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let h = harness();
        let app = build_api_router(h.state);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn concurrent_run_start_conflicts_then_cancel_clears() {
        let h = harness();
        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(app, Method::POST, "/run", None).await;
        assert_eq!(status, StatusCode::OK);
        let run_id = json["run_id"].as_str().unwrap().to_string();

        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(app, Method::POST, "/run", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "already-active");
        assert_eq!(json["run_id"], run_id.as_str());

        let app = build_api_router(h.state.clone());
        let (status, _) = json_request(app, Method::GET, "/run/status", None).await;
        assert_eq!(status, StatusCode::OK);

        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(app, Method::POST, "/run/cancel", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["run"]["status"], "cancelled");

        let app = build_api_router(h.state.clone());
        let (status, _) = json_request(app, Method::POST, "/run/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Cooldown (measured from the cancelled run's start) now throttles.
        let app = build_api_router(h.state);
        let (status, json) = json_request(app, Method::POST, "/run", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["error"], "cooling-down");
        assert!(json["retry_after_ms"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn commit_validates_input_and_conflicts_on_pending() {
        let h = harness();

        let app = build_api_router(h.state.clone());
        let (status, _) = json_request(
            app,
            Method::POST,
            "/wager/commit",
            Some(serde_json::json!({ "requester": "", "stake": 100, "choice": "heads" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let app = build_api_router(h.state.clone());
        let (status, _) = json_request(
            app,
            Method::POST,
            "/wager/commit",
            Some(serde_json::json!({ "requester": "alice", "stake": 100, "choice": "edge" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/wager/commit",
            Some(serde_json::json!({ "requester": "alice", "stake": 1, "choice": "heads" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["min_stake"], 10);

        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(
            app,
            Method::POST,
            "/wager/commit",
            Some(serde_json::json!({ "requester": "alice", "stake": 100, "choice": "heads" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["commitment_hash"].as_str().unwrap().len() == 64);
        assert_eq!(json["deposit"]["address"], "hot");
        assert!(json.get("secret").is_none());

        let app = build_api_router(h.state);
        let (status, _) = json_request(
            app,
            Method::POST,
            "/wager/commit",
            Some(serde_json::json!({ "requester": "alice", "stake": 100, "choice": "heads" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn resolve_round_trip_with_idempotent_replay() {
        let h = harness();

        let app = build_api_router(h.state.clone());
        let (_, json) = json_request(
            app,
            Method::POST,
            "/wager/commit",
            Some(serde_json::json!({ "requester": "alice", "stake": 100, "choice": "tails" })),
        )
        .await;
        let commitment_id = json["commitment_id"].as_str().unwrap().to_string();

        // Secret stays hidden while pending.
        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(
            app,
            Method::GET,
            &format!("/wager/status/{}", commitment_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["secret"].is_null());

        h.ledger.allow_proof("sig-deposit-1");
        let app = build_api_router(h.state.clone());
        let (status, first) = json_request(
            app,
            Method::POST,
            "/wager/resolve",
            Some(serde_json::json!({
                "commitment_id": commitment_id,
                "deposit_proof": "sig-deposit-1",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["already_resolved"], false);
        assert!(first["secret"].as_str().unwrap().len() == 64);

        // Replay: conflict status, byte-identical result fields.
        let app = build_api_router(h.state.clone());
        let (status, second) = json_request(
            app,
            Method::POST,
            "/wager/resolve",
            Some(serde_json::json!({
                "commitment_id": commitment_id,
                "deposit_proof": "sig-deposit-1",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(second["already_resolved"], true);
        assert_eq!(first["result"], second["result"]);
        assert_eq!(first["won"], second["won"]);
        assert_eq!(first["payout"], second["payout"]);
        assert_eq!(first["secret"], second["secret"]);

        // Status now reveals the secret.
        let app = build_api_router(h.state);
        let (_, json) = json_request(
            app,
            Method::GET,
            &format!("/wager/status/{}", commitment_id),
            None,
        )
        .await;
        assert_eq!(json["secret"], first["secret"]);
    }

    #[tokio::test]
    async fn resolve_unknown_commitment_is_not_found() {
        let h = harness();
        let app = build_api_router(h.state);
        let (status, _) = json_request(
            app,
            Method::POST,
            "/wager/resolve",
            Some(serde_json::json!({
                "commitment_id": "nope",
                "deposit_proof": "sig",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn limits_and_stats_expose_counters() {
        let h = harness();
        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(app, Method::GET, "/limits", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["run"]["gate"], "allowed");
        assert_eq!(json["wager"]["min_stake"], 10);

        let app = build_api_router(h.state.clone());
        let (status, json) = json_request(app, Method::GET, "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["runs_shipped"], 0);
        assert_eq!(json["net_loss"], 0);

        let app = build_api_router(h.state);
        let (status, json) =
            json_request(app, Method::GET, "/wager/pending-review", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pending"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn run_control_requires_operator_token_when_configured() {
        let h = harness_with_token(Some("secret-token".to_string()));

        let app = build_api_router(h.state.clone());
        let (status, _) = json_request(app, Method::POST, "/run", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Wager routes stay public.
        let app = build_api_router(h.state.clone());
        let (status, _) = json_request(
            app,
            Method::POST,
            "/wager/commit",
            Some(serde_json::json!({ "requester": "alice", "stake": 100, "choice": "heads" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let app = build_api_router(h.state);
        let req = Request::builder()
            .method(Method::POST)
            .uri("/run")
            .header("content-type", "application/json")
            .header("x-forge-internal-token", "secret-token")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_route_contract_has_all_expected_paths() {
        let paths = [
            "/health",
            "/run",
            "/run/cancel",
            "/run/status",
            "/wager/commit",
            "/wager/resolve",
            "/wager/status/some-id",
            "/wager/cancel",
            "/wager/pending-review",
            "/stats",
            "/limits",
            "/api/logs",
        ];

        let h = harness();
        let app = build_api_router(h.state);
        for path in paths {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::empty())
                .expect("request should build");
            let resp = app
                .clone()
                .oneshot(req)
                .await
                .expect("router oneshot should succeed");
            assert_ne!(
                resp.status(),
                StatusCode::NOT_FOUND,
                "Route missing from router: {}",
                path
            );
        }
    }
}
