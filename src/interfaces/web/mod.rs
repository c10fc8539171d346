pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tracing::info;

use crate::core::config::WagerConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::limits::RateLimiter;
use crate::core::pipeline::PipelineOrchestrator;
use crate::core::store::StateStore;
use crate::core::wager::{CommitRevealEngine, WalletTierManager};

pub struct ApiServerConfig {
    pub store: Arc<StateStore>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub engine: Arc<CommitRevealEngine>,
    pub limiter: Arc<RateLimiter>,
    pub wallets: Arc<WalletTierManager>,
    pub wager_config: WagerConfig,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub internal_token: Option<String>,
}

pub struct ApiServer {
    config: Option<ApiServerConfig>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<StateStore>,
    pub(crate) orchestrator: Arc<PipelineOrchestrator>,
    pub(crate) engine: Arc<CommitRevealEngine>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) wallets: Arc<WalletTierManager>,
    pub(crate) wager_config: WagerConfig,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_port: u16,
    pub(crate) internal_token: Option<String>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            config: Some(config),
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });
    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let Some(config) = self.config.take() else {
            return Ok(());
        };
        let addr = format!("{}:{}", config.api_host, config.api_port);
        let state = AppState {
            store: config.store,
            orchestrator: config.orchestrator,
            engine: config.engine,
            limiter: config.limiter,
            wallets: config.wallets,
            wager_config: config.wager_config,
            log_tx: config.log_tx,
            api_port: config.api_port,
            internal_token: config.internal_token,
        };

        tokio::spawn(async move {
            let app = router::build_api_router(state);
            if let Ok(listener) = tokio::net::TcpListener::bind(&addr).await {
                info!("API server running at http://{addr}");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("API server crashed: {}", e);
                }
            } else {
                tracing::error!("API server failed to bind {addr}");
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        Ok(())
    }
}
