pub mod collaborators;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::config::PipelineConfig;
use crate::core::limits::{Gate, RateLimiter};
use crate::core::store::types::{Phase, Run};
use crate::core::store::{RunStartOutcome, StateStore, now_ms};
use crate::core::supervisor::{ProcessSupervisor, SweepReport};
use crate::core::wager::WalletTierManager;
use crate::platform::{NativePlatform, Platform};
use collaborators::{Announcer, Builder, ChainInitializer, Deployer, GamePlan, Planner, PreviewRenderer};

/// External collaborators the orchestrator delegates phase work to. The
/// optional ones downgrade their phase to a logged skip when absent.
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub builder: Arc<dyn Builder>,
    pub deployer: Arc<dyn Deployer>,
    pub renderer: Option<Arc<dyn PreviewRenderer>>,
    pub announcer: Option<Arc<dyn Announcer>>,
    pub chain: Option<Arc<dyn ChainInitializer>>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StartOutcome {
    Started { run_id: String },
    AlreadyActive { run_id: String },
    CoolingDown { remaining_ms: i64 },
    DailyCapReached { cap: u32 },
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled(Run),
    NotFound,
}

/// Top-level state machine sequencing the pipeline phases. Progress is
/// persisted after every phase so a crash mid-run is recoverable; the
/// pipeline re-reads its own run row at each boundary, which is how an
/// operator cancel cooperatively halts it.
pub struct PipelineOrchestrator {
    store: Arc<StateStore>,
    config: PipelineConfig,
    collaborators: Collaborators,
    supervisor: Arc<ProcessSupervisor>,
    limiter: Arc<RateLimiter>,
    wallets: Arc<WalletTierManager>,
    events: broadcast::Sender<String>,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<StateStore>,
        config: PipelineConfig,
        collaborators: Collaborators,
        supervisor: Arc<ProcessSupervisor>,
        limiter: Arc<RateLimiter>,
        wallets: Arc<WalletTierManager>,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            store,
            config,
            collaborators,
            supervisor,
            limiter,
            wallets,
            events,
        }
    }

    /// Start a run unless one is active or the limiter says otherwise. The
    /// whole check lives inside one StateStore transaction; on success the
    /// pipeline itself runs as a background task and progress is observable
    /// through `status()` and the event stream.
    pub async fn start(self: &Arc<Self>, force: bool) -> Result<StartOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let outcome = self
            .store
            .try_begin_run(
                &run_id,
                now_ms(),
                self.config.cooldown_ms,
                self.config.max_runs_per_day,
                force,
            )
            .await?;

        match outcome {
            RunStartOutcome::Started(run) => {
                info!("Run {} started{}", run.id, if force { " (forced)" } else { "" });
                let orchestrator = self.clone();
                tokio::spawn(async move {
                    orchestrator.run_pipeline(run.id).await;
                });
                Ok(StartOutcome::Started { run_id })
            }
            RunStartOutcome::AlreadyActive { run_id } => {
                Ok(StartOutcome::AlreadyActive { run_id })
            }
            RunStartOutcome::CoolingDown { remaining_ms } => {
                Ok(StartOutcome::CoolingDown { remaining_ms })
            }
            RunStartOutcome::DailyCapReached { cap } => {
                Ok(StartOutcome::DailyCapReached { cap })
            }
        }
    }

    /// Kill the tracked build process (plus any stragglers found by name)
    /// and close the run. Killing is best-effort; a process that already
    /// exited is not an error.
    pub async fn cancel(&self) -> Result<CancelOutcome> {
        let Some(run) = self.store.active_run().await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if let Some(pid) = run.builder_pid.as_deref() {
            ProcessSupervisor::kill_process(pid);
        }
        for pid in NativePlatform::find_pids_by_name(&self.config.builder_process_name) {
            ProcessSupervisor::kill_process(&pid);
        }
        self.store
            .cancel_run(&run.id, "cancelled by operator", now_ms())
            .await?;
        self.emit("run_cancelled", serde_json::json!({ "run_id": run.id }));
        let closed = self.store.get_run(&run.id).await?.unwrap_or(run);
        Ok(CancelOutcome::Cancelled(closed))
    }

    /// The active run if there is one, otherwise the most recent.
    pub async fn status(&self) -> Result<Option<Run>> {
        if let Some(run) = self.store.active_run().await? {
            return Ok(Some(run));
        }
        self.store.latest_run().await
    }

    /// Once at startup: close runs a dead process left behind and kill their
    /// external processes, before any new work is accepted.
    pub async fn recover_on_startup(&self) -> Result<SweepReport> {
        let report = self.supervisor.sweep_orphans().await?;
        if report.cancelled_runs > 0 || report.killed > 0 {
            info!(
                "Startup recovery: {} run(s) closed, {} process(es) killed",
                report.cancelled_runs, report.killed
            );
        }
        Ok(report)
    }

    async fn run_pipeline(&self, run_id: String) {
        if let Err(e) = self.drive(&run_id).await {
            error!("Run {} aborted on internal error: {:#}", run_id, e);
            let _ = self
                .store
                .cancel_run(&run_id, &format!("internal error: {e:#}"), now_ms())
                .await;
        }
    }

    async fn drive(&self, run_id: &str) -> Result<()> {
        self.emit("run_started", serde_json::json!({ "run_id": run_id }));

        // Plan
        if !self.advance(run_id, Phase::Plan).await? {
            return Ok(());
        }
        let plan = match self.collaborators.planner.plan().await {
            Ok(plan) => plan,
            Err(e) => return self.terminate(run_id, Phase::Plan, e).await,
        };
        self.store
            .set_run_artifact(run_id, &plan.slug, &plan.name, &plan.description)
            .await?;

        // Build: the only phase whose failure is always terminal.
        if !self.advance(run_id, Phase::Build).await? {
            return Ok(());
        }
        let artifact = match self.run_build(run_id, &plan).await {
            Ok(output) => output.artifact_ref,
            Err(e) => return self.terminate(run_id, Phase::Build, e).await,
        };

        // Deploy
        if !self.advance(run_id, Phase::Deploy).await? {
            return Ok(());
        }
        let deploy = match self.collaborators.deployer.deploy(&artifact, &plan.slug).await {
            Ok(deploy) => deploy,
            Err(e) => return self.terminate(run_id, Phase::Deploy, e).await,
        };
        self.store.set_run_deploy_url(run_id, &deploy.url).await?;

        // Initialize: best-effort; without an on-chain pool the game still
        // ships, in demo mode.
        if !self.advance(run_id, Phase::Initialize).await? {
            return Ok(());
        }
        self.initialize_chain(run_id, &plan).await?;

        // Calibrate: bounded retries, then a warning rather than a failure.
        if !self.advance(run_id, Phase::Calibrate).await? {
            return Ok(());
        }
        self.calibrate(run_id, &deploy.url).await;

        // Preview: best-effort.
        if !self.advance(run_id, Phase::Preview).await? {
            return Ok(());
        }
        let media = self.render_preview(&plan, &deploy.url).await;

        // Announce: gated by the announcement limiter.
        if !self.advance(run_id, Phase::Announce).await? {
            return Ok(());
        }
        if let Err(e) = self.announce(run_id, &plan, &deploy.url, media.as_deref()).await {
            return self.terminate(run_id, Phase::Announce, e).await;
        }

        // Complete
        if !self.advance(run_id, Phase::Complete).await? {
            return Ok(());
        }
        self.store.finish_run_completed(run_id, now_ms()).await?;
        self.emit(
            "run_completed",
            serde_json::json!({ "run_id": run_id, "slug": plan.slug, "url": deploy.url }),
        );
        info!("Run {} completed: {} at {}", run_id, plan.slug, deploy.url);
        Ok(())
    }

    /// Persist the next phase. Returns false when the run was closed
    /// underneath the pipeline (operator cancel), halting progression.
    async fn advance(&self, run_id: &str, phase: Phase) -> Result<bool> {
        let alive = self.store.set_run_phase(run_id, phase).await?;
        if alive {
            self.emit(
                "phase",
                serde_json::json!({ "run_id": run_id, "phase": phase.as_str() }),
            );
        } else {
            info!("Run {} closed before {}, stopping", run_id, phase.as_str());
        }
        Ok(alive)
    }

    async fn run_build(
        &self,
        run_id: &str,
        plan: &GamePlan,
    ) -> Result<collaborators::BuildOutput> {
        let (pid_tx, mut pid_rx) = mpsc::channel(1);
        let supervisor = self.supervisor.clone();
        let tracked_run = run_id.to_string();
        tokio::spawn(async move {
            if let Some(pid) = pid_rx.recv().await {
                if let Err(e) = supervisor.track_process(&tracked_run, pid).await {
                    warn!("Failed to record builder pid {}: {}", pid, e);
                }
            }
        });

        let result = self.collaborators.builder.build(plan, pid_tx).await;
        self.supervisor.clear_process(run_id).await?;
        result
    }

    async fn initialize_chain(&self, run_id: &str, plan: &GamePlan) -> Result<()> {
        let Some(chain) = &self.collaborators.chain else {
            self.store.set_run_demo_mode(run_id).await?;
            self.emit(
                "demo_mode",
                serde_json::json!({ "run_id": run_id, "reason": "no chain initializer configured" }),
            );
            return Ok(());
        };
        match chain.initialize(&plan.slug, &plan.name).await {
            Ok(init) => {
                info!("Initialized pool {} for {}", init.pool_address, plan.slug);
                if init.burn_amount > 0 {
                    if let Err(e) = self.wallets.burn_via_airlock(init.burn_amount).await {
                        warn!("Launch burn skipped: {:#}", e);
                    }
                }
            }
            Err(e) => {
                warn!("Chain init failed, shipping {} in demo mode: {:#}", plan.slug, e);
                self.store.set_run_demo_mode(run_id).await?;
                self.emit(
                    "demo_mode",
                    serde_json::json!({ "run_id": run_id, "reason": format!("{e:#}") }),
                );
            }
        }
        Ok(())
    }

    async fn calibrate(&self, run_id: &str, url: &str) {
        for attempt in 1..=self.config.calibrate_attempts {
            match self.collaborators.deployer.verify(url).await {
                Ok(true) => return,
                Ok(false) => warn!("Calibration attempt {} saw unreachable {}", attempt, url),
                Err(e) => warn!("Calibration attempt {} errored: {:#}", attempt, e),
            }
            if attempt < self.config.calibrate_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.calibrate_backoff_ms)).await;
            }
        }
        warn!(
            "Calibration gave up after {} attempts; run continues",
            self.config.calibrate_attempts
        );
        self.emit(
            "calibration_warning",
            serde_json::json!({ "run_id": run_id, "attempts": self.config.calibrate_attempts }),
        );
    }

    async fn render_preview(&self, plan: &GamePlan, url: &str) -> Option<String> {
        let renderer = self.collaborators.renderer.as_ref()?;
        match renderer.render(plan, url).await {
            Ok(media) => Some(media),
            Err(e) => {
                warn!("Preview render failed, announcing without media: {:#}", e);
                None
            }
        }
    }

    async fn announce(
        &self,
        run_id: &str,
        plan: &GamePlan,
        url: &str,
        media: Option<&str>,
    ) -> Result<()> {
        let Some(announcer) = &self.collaborators.announcer else {
            info!("No announcer configured, skipping announcement");
            return Ok(());
        };
        match self.limiter.can_announce(now_ms()).await? {
            Gate::Allowed => {
                let text = format!("{} just shipped. Play it now: {}", plan.name, url);
                let post_id = announcer.post(&text, media).await?;
                self.limiter.record_announcement(now_ms()).await?;
                self.emit(
                    "announced",
                    serde_json::json!({ "run_id": run_id, "post_id": post_id }),
                );
            }
            Gate::Denied { reason, .. } => {
                info!("Announcement skipped: {}", reason);
                self.emit(
                    "announce_skipped",
                    serde_json::json!({ "run_id": run_id, "reason": reason }),
                );
            }
        }
        Ok(())
    }

    async fn terminate(&self, run_id: &str, phase: Phase, err: anyhow::Error) -> Result<()> {
        error!("Run {} failed during {}: {:#}", run_id, phase.as_str(), err);
        self.store
            .fail_run(run_id, phase, &format!("{err:#}"), now_ms())
            .await?;
        self.emit(
            "run_failed",
            serde_json::json!({
                "run_id": run_id,
                "phase": phase.as_str(),
                "error": format!("{err:#}"),
            }),
        );
        Ok(())
    }

    fn emit(&self, event: &str, mut data: serde_json::Value) {
        if let Some(object) = data.as_object_mut() {
            object.insert("event".to_string(), serde_json::json!(event));
        }
        let _ = self.events.send(data.to_string()); // Ignored if no receivers
    }
}

#[cfg(test)]
mod tests;
