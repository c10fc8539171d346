use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::Job;
use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::lifecycle::LifecycleManager;
use crate::core::limits::RateLimiter;
use crate::core::pipeline::collaborators::{
    Announcer, Builder, ChainInitializer, Deployer, HttpAnnouncer, HttpChainInitializer,
    HttpDeployer, HttpPlanner, HttpRenderer, Planner, PreviewRenderer, ProcessBuilder,
    StaticPlanner, UnconfiguredDeployer,
};
use crate::core::pipeline::{Collaborators, PipelineOrchestrator, StartOutcome};
use crate::core::store::{StateStore, now_ms};
use crate::core::supervisor::ProcessSupervisor;
use crate::core::terminal;
use crate::core::wager::{
    CommitRevealEngine, Ledger, RpcLedger, UnconfiguredLedger, WalletTierManager,
};
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging::BroadcastMakeWriter;
use crate::platform::{NativePlatform, Platform};

/// Composition root: wires store, collaborators, engines and the HTTP
/// surface together, runs startup recovery, registers the timers, then
/// parks until interrupted.
pub async fn serve_forever(
    api_host: Option<String>,
    api_port: Option<u16>,
    suppress_stdout: bool,
) -> Result<()> {
    let data_dir = NativePlatform::data_dir();
    let config = Config::load_or_create(&data_dir)?;
    let api_host = api_host.unwrap_or_else(|| config.api.host.clone());
    let api_port = api_port.unwrap_or(config.api.port);

    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(256);
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(BroadcastMakeWriter {
            sender: log_tx.clone(),
            suppress_stdout,
        })
        .init();

    let store = Arc::new(StateStore::open(&data_dir).await?);

    let ledger: Arc<dyn Ledger> = match &config.collaborators.ledger_endpoint {
        Some(endpoint) => Arc::new(RpcLedger::new(endpoint.clone())),
        None => {
            warn!("No ledger endpoint configured; wagering will reject deposits");
            Arc::new(UnconfiguredLedger)
        }
    };
    let wallets = Arc::new(WalletTierManager::new(
        store.clone(),
        ledger.clone(),
        config.wallets.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        config.pipeline.clone(),
        config.announcer.clone(),
    ));
    let supervisor = Arc::new(ProcessSupervisor::new(
        store.clone(),
        config.pipeline.builder_process_name.clone(),
    ));
    let engine = Arc::new(CommitRevealEngine::new(
        store.clone(),
        ledger.clone(),
        wallets.clone(),
        config.wager.clone(),
    ));

    let planner: Arc<dyn Planner> = match &config.collaborators.planner_endpoint {
        Some(endpoint) => Arc::new(HttpPlanner::new(endpoint.clone())),
        None => Arc::new(StaticPlanner),
    };
    let builder: Arc<dyn Builder> = Arc::new(ProcessBuilder::new(
        config.collaborators.build_command.clone(),
    ));
    let deployer: Arc<dyn Deployer> = match &config.collaborators.deploy_endpoint {
        Some(endpoint) => Arc::new(HttpDeployer::new(endpoint.clone())),
        None => {
            warn!("No deploy endpoint configured; runs will fail at the deploy phase");
            Arc::new(UnconfiguredDeployer)
        }
    };
    let renderer: Option<Arc<dyn PreviewRenderer>> = config
        .collaborators
        .renderer_endpoint
        .clone()
        .map(|endpoint| Arc::new(HttpRenderer::new(endpoint)) as Arc<dyn PreviewRenderer>);
    let announcer: Option<Arc<dyn Announcer>> = config
        .announcer
        .endpoint
        .clone()
        .map(|endpoint| Arc::new(HttpAnnouncer::new(endpoint)) as Arc<dyn Announcer>);
    let chain: Option<Arc<dyn ChainInitializer>> = config
        .collaborators
        .chain_endpoint
        .clone()
        .map(|endpoint| Arc::new(HttpChainInitializer::new(endpoint)) as Arc<dyn ChainInitializer>);

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store.clone(),
        config.pipeline.clone(),
        Collaborators {
            planner,
            builder,
            deployer,
            renderer,
            announcer,
            chain,
        },
        supervisor,
        limiter.clone(),
        wallets.clone(),
        log_tx.clone(),
    ));

    // Recover before the listener accepts any traffic.
    orchestrator
        .recover_on_startup()
        .await
        .context("startup recovery")?;
    let expired = store.expire_stale_commitments(now_ms()).await?;
    if expired > 0 {
        info!("Expired {} stale commitment(s) at startup", expired);
    }

    let mut lifecycle = LifecycleManager::new().await?;
    let api_server = ApiServer::new(ApiServerConfig {
        store: store.clone(),
        orchestrator: orchestrator.clone(),
        engine,
        limiter,
        wallets: wallets.clone(),
        wager_config: config.wager.clone(),
        log_tx,
        api_host: api_host.clone(),
        api_port,
        internal_token: config.api.internal_token.clone(),
    });
    lifecycle.attach(Arc::new(Mutex::new(api_server)));

    register_timers(&lifecycle, &config, store.clone(), orchestrator, wallets).await?;
    lifecycle.start().await?;

    if !suppress_stdout {
        terminal::print_banner();
        terminal::print_link("API", &format!("http://{}:{}", api_host, api_port));
        terminal::print_status("Data dir", &data_dir.display().to_string());
    }

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await?;
    Ok(())
}

async fn register_timers(
    lifecycle: &LifecycleManager,
    config: &Config,
    store: Arc<StateStore>,
    orchestrator: Arc<PipelineOrchestrator>,
    wallets: Arc<WalletTierManager>,
) -> Result<()> {
    // Autonomous daily run trigger.
    if let Some(cron) = &config.pipeline.auto_run_cron {
        let orchestrator = orchestrator.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, mut _l| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                match orchestrator.start(false).await {
                    Ok(StartOutcome::Started { run_id }) => {
                        info!("Scheduled run {} started", run_id)
                    }
                    Ok(other) => info!("Scheduled run skipped: {:?}", other),
                    Err(e) => warn!("Scheduled run failed to start: {:#}", e),
                }
            })
        })
        .context("invalid auto_run_cron expression")?;
        lifecycle.scheduler.add(job).await?;
    }

    // Commitment-expiry sweep, every minute. Re-reads live state each tick.
    let sweep_store = store.clone();
    let sweep = Job::new_async("0 * * * * *", move |_uuid, mut _l| {
        let store = sweep_store.clone();
        Box::pin(async move {
            match store.expire_stale_commitments(now_ms()).await {
                Ok(n) if n > 0 => info!("Expired {} stale commitment(s)", n),
                Ok(_) => {}
                Err(e) => warn!("Expiry sweep failed: {:#}", e),
            }
        })
    })?;
    lifecycle.scheduler.add(sweep).await?;

    // Hourly hot-wallet top-up check and snapshot refresh.
    let topup_wallets = wallets.clone();
    let topup = Job::new_async("0 7 * * * *", move |_uuid, mut _l| {
        let wallets = topup_wallets.clone();
        Box::pin(async move {
            if let Err(e) = wallets.sync_snapshots().await {
                warn!("Wallet snapshot sync failed: {:#}", e);
            }
            match wallets.top_up_if_needed().await {
                Ok(outcome) => info!("Top-up check: {:?}", outcome),
                Err(e) => warn!("Top-up check failed: {:#}", e),
            }
        })
    })?;
    lifecycle.scheduler.add(topup).await?;

    Ok(())
}
