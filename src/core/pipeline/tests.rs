use super::collaborators::{
    Announcer, BuildOutput, Builder, ChainInit, ChainInitializer, DeployOutput, Deployer,
    GamePlan, Planner, PreviewRenderer,
};
use super::*;
use crate::core::config::{AnnouncerConfig, WalletConfig};
use crate::core::store::types::RunStatus;
use crate::core::wager::testing::MockLedger;
use anyhow::bail;
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};

struct FixedPlanner;

#[async_trait]
impl Planner for FixedPlanner {
    async fn plan(&self) -> Result<GamePlan> {
        Ok(GamePlan {
            slug: "test-game".to_string(),
            name: "Test Game".to_string(),
            description: "A test artifact.".to_string(),
            build_spec: "{}".to_string(),
        })
    }
}

#[derive(Default)]
struct TestBuilder {
    fail: bool,
    pid: Option<u32>,
    /// When set, the build blocks until notified, keeping the run active.
    gate: Option<Arc<tokio::sync::Notify>>,
}

#[async_trait]
impl Builder for TestBuilder {
    async fn build(&self, plan: &GamePlan, pid_tx: mpsc::Sender<u32>) -> Result<BuildOutput> {
        if let Some(pid) = self.pid {
            let _ = pid_tx.send(pid).await;
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            bail!("build tool exited with signal 11");
        }
        Ok(BuildOutput {
            artifact_ref: format!("builds/{}", plan.slug),
        })
    }
}

struct TestDeployer {
    reachable: bool,
    deploys: AtomicU32,
    verifies: AtomicU32,
}

impl TestDeployer {
    fn new(reachable: bool) -> Self {
        Self {
            reachable,
            deploys: AtomicU32::new(0),
            verifies: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Deployer for TestDeployer {
    async fn deploy(&self, _artifact_ref: &str, slug: &str) -> Result<DeployOutput> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        Ok(DeployOutput {
            url: format!("https://games.test/{}", slug),
        })
    }

    async fn verify(&self, _url: &str) -> Result<bool> {
        self.verifies.fetch_add(1, Ordering::SeqCst);
        Ok(self.reachable)
    }
}

#[derive(Default)]
struct TestAnnouncer {
    posts: StdMutex<Vec<String>>,
}

#[async_trait]
impl Announcer for TestAnnouncer {
    async fn post(&self, text: &str, _media: Option<&str>) -> Result<String> {
        let mut posts = self.posts.lock().unwrap();
        posts.push(text.to_string());
        Ok(format!("post-{}", posts.len()))
    }
}

struct TestRenderer;

#[async_trait]
impl PreviewRenderer for TestRenderer {
    async fn render(&self, plan: &GamePlan, _url: &str) -> Result<String> {
        Ok(format!("clips/{}.mp4", plan.slug))
    }
}

struct TestChain;

#[async_trait]
impl ChainInitializer for TestChain {
    async fn initialize(&self, slug: &str, _name: &str) -> Result<ChainInit> {
        Ok(ChainInit {
            pool_address: format!("pool-{}", slug),
            burn_amount: 0,
        })
    }
}

struct Harness {
    store: Arc<StateStore>,
    orchestrator: Arc<PipelineOrchestrator>,
    announcer: Arc<TestAnnouncer>,
    deployer: Arc<TestDeployer>,
    limiter: Arc<RateLimiter>,
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        max_runs_per_day: 10,
        cooldown_ms: 0,
        auto_run_cron: None,
        calibrate_attempts: 3,
        calibrate_backoff_ms: 1,
        builder_process_name: "gameforge-test-no-such-tool".to_string(),
    }
}

fn harness_with(
    config: PipelineConfig,
    builder: TestBuilder,
    deployer: TestDeployer,
    chain: Option<Arc<dyn ChainInitializer>>,
) -> Harness {
    let store = Arc::new(StateStore::open_in_memory());
    let announcer = Arc::new(TestAnnouncer::default());
    let deployer = Arc::new(deployer);
    let supervisor = Arc::new(ProcessSupervisor::new(
        store.clone(),
        config.builder_process_name.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        config.clone(),
        AnnouncerConfig {
            max_posts_per_day: 15,
            min_interval_ms: 0,
            endpoint: None,
        },
    ));
    let wallets = Arc::new(WalletTierManager::new(
        store.clone(),
        Arc::new(MockLedger::default()),
        WalletConfig::default(),
    ));
    let (events, _) = broadcast::channel(64);

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store.clone(),
        config,
        Collaborators {
            planner: Arc::new(FixedPlanner),
            builder: Arc::new(builder),
            deployer: deployer.clone(),
            renderer: Some(Arc::new(TestRenderer)),
            announcer: Some(announcer.clone()),
            chain,
        },
        supervisor,
        limiter.clone(),
        wallets,
        events,
    ));

    Harness {
        store,
        orchestrator,
        announcer,
        deployer,
        limiter,
    }
}

fn harness() -> Harness {
    harness_with(
        pipeline_config(),
        TestBuilder::default(),
        TestDeployer::new(true),
        Some(Arc::new(TestChain)),
    )
}

async fn wait_until_inactive(store: &StateStore) {
    for _ in 0..500 {
        if store.active_run().await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run never finished");
}

fn started_id(outcome: StartOutcome) -> String {
    match outcome {
        StartOutcome::Started { run_id } => run_id,
        other => panic!("expected Started, got {:?}", other),
    }
}

#[tokio::test]
async fn pipeline_completes_and_announces() {
    let h = harness();
    let run_id = started_id(h.orchestrator.start(false).await.unwrap());
    wait_until_inactive(&h.store).await;

    let run = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.phase, Phase::DONE_INDEX);
    assert_eq!(run.slug.as_deref(), Some("test-game"));
    assert_eq!(
        run.deploy_url.as_deref(),
        Some("https://games.test/test-game")
    );
    assert!(!run.demo_mode);
    assert!(run.ended_at.is_some());

    let posts = h.announcer.posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].contains("https://games.test/test-game"));

    let counters = h
        .store
        .counters_for_day(&crate::core::store::day_key(now_ms()))
        .await
        .unwrap();
    assert_eq!(counters.runs_shipped, 1);
}

#[tokio::test]
async fn build_failure_terminates_the_run() {
    let h = harness_with(
        pipeline_config(),
        TestBuilder {
            fail: true,
            ..Default::default()
        },
        TestDeployer::new(true),
        None,
    );
    let run_id = started_id(h.orchestrator.start(false).await.unwrap());
    wait_until_inactive(&h.store).await;

    let run = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    let error = run.error.unwrap();
    assert!(error.starts_with("build:"), "error was: {}", error);
    // Nothing downstream of the failed build ran.
    assert_eq!(h.deployer.deploys.load(Ordering::SeqCst), 0);
    assert!(h.announcer.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_start_conflicts_and_cancel_halts_progression() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let h = harness_with(
        pipeline_config(),
        TestBuilder {
            pid: Some(77_777),
            gate: Some(gate.clone()),
            ..Default::default()
        },
        TestDeployer::new(true),
        None,
    );
    let run_id = started_id(h.orchestrator.start(false).await.unwrap());

    // Give the pipeline a moment to enter the build phase.
    for _ in 0..100 {
        let run = h.store.get_run(&run_id).await.unwrap().unwrap();
        if run.builder_pid.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    match h.orchestrator.start(false).await.unwrap() {
        StartOutcome::AlreadyActive { run_id: active } => assert_eq!(active, run_id),
        other => panic!("expected AlreadyActive, got {:?}", other),
    }

    match h.orchestrator.cancel().await.unwrap() {
        CancelOutcome::Cancelled(run) => {
            assert_eq!(run.id, run_id);
            assert_eq!(run.status, RunStatus::Cancelled);
        }
        CancelOutcome::NotFound => panic!("expected a cancellable run"),
    }
    assert!(matches!(
        h.orchestrator.cancel().await.unwrap(),
        CancelOutcome::NotFound
    ));

    // Release the builder: the pipeline notices the closed run and stops
    // before deploying.
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.deployer.deploys.load(Ordering::SeqCst), 0);
    let run = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error.as_deref(), Some("cancelled by operator"));
}

#[tokio::test]
async fn missing_chain_initializer_ships_demo_mode() {
    let h = harness_with(
        pipeline_config(),
        TestBuilder::default(),
        TestDeployer::new(true),
        None,
    );
    let run_id = started_id(h.orchestrator.start(false).await.unwrap());
    wait_until_inactive(&h.store).await;

    let run = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.demo_mode);
}

#[tokio::test]
async fn unreachable_deployment_is_a_warning_not_a_failure() {
    let h = harness_with(
        pipeline_config(),
        TestBuilder::default(),
        TestDeployer::new(false),
        None,
    );
    let run_id = started_id(h.orchestrator.start(false).await.unwrap());
    wait_until_inactive(&h.store).await;

    let run = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    // All three bounded attempts were spent.
    assert_eq!(h.deployer.verifies.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn announcement_is_skipped_when_the_limiter_denies() {
    let h = harness();
    // Exhaust today's announcement allowance.
    for _ in 0..15 {
        h.limiter.record_announcement(now_ms()).await.unwrap();
    }

    let run_id = started_id(h.orchestrator.start(false).await.unwrap());
    wait_until_inactive(&h.store).await;

    let run = h.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(h.announcer.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cooldown_rejection_reports_remaining_wait() {
    let mut config = pipeline_config();
    config.cooldown_ms = 60 * 60 * 1000;
    let h = harness_with(
        config,
        TestBuilder::default(),
        TestDeployer::new(true),
        None,
    );
    started_id(h.orchestrator.start(false).await.unwrap());
    wait_until_inactive(&h.store).await;

    match h.orchestrator.start(false).await.unwrap() {
        StartOutcome::CoolingDown { remaining_ms } => {
            assert!(remaining_ms > 0 && remaining_ms <= 60 * 60 * 1000)
        }
        other => panic!("expected CoolingDown, got {:?}", other),
    }

    // Force skips the cooldown.
    let forced = started_id(h.orchestrator.start(true).await.unwrap());
    wait_until_inactive(&h.store).await;
    let run = h.store.get_run(&forced).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn startup_recovery_closes_orphaned_runs() {
    let h = harness();
    let now = now_ms();
    h.store
        .try_begin_run("stale-run", now, 0, 10, false)
        .await
        .unwrap();
    h.store
        .set_run_builder_pid("stale-run", Some("99999999"))
        .await
        .unwrap();

    let report = h.orchestrator.recover_on_startup().await.unwrap();
    assert_eq!(report.cancelled_runs, 1);

    let run = h.store.get_run("stale-run").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    // And a new run can start immediately afterwards.
    started_id(h.orchestrator.start(true).await.unwrap());
}
