use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::store::{StateStore, now_ms};
use crate::platform::{NativePlatform, Platform};

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SweepReport {
    pub cancelled_runs: usize,
    pub killed: usize,
}

/// Tracks the OS process spawned by the build phase and cleans up after
/// crashes. The DB-recorded pid is the primary mechanism; the process-name
/// scan is a documented best-effort safety net for hard crashes where the
/// pid never reached the store.
pub struct ProcessSupervisor {
    store: Arc<StateStore>,
    builder_process_name: String,
}

impl ProcessSupervisor {
    pub fn new(store: Arc<StateStore>, builder_process_name: String) -> Self {
        Self {
            store,
            builder_process_name,
        }
    }

    pub async fn track_process(&self, run_id: &str, pid: u32) -> Result<()> {
        self.store
            .set_run_builder_pid(run_id, Some(&pid.to_string()))
            .await
    }

    pub async fn clear_process(&self, run_id: &str) -> Result<()> {
        self.store.set_run_builder_pid(run_id, None).await
    }

    /// Best-effort terminate. Absence of the process is not an error.
    pub fn kill_process(pid: &str) -> bool {
        match NativePlatform::kill_process(pid) {
            Ok(output) if output.status.success() => true,
            Ok(_) => false,
            Err(e) => {
                warn!("Failed to signal pid {}: {}", pid, e);
                false
            }
        }
    }

    /// Startup sweep: close runs a previous process left active (killing
    /// their recorded pid), then scan the OS process table for builder
    /// processes the store never heard about.
    pub async fn sweep_orphans(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = now_ms();

        for run in self.store.orphaned_active_runs().await? {
            if let Some(pid) = run.builder_pid.as_deref() {
                if Self::kill_process(pid) {
                    report.killed += 1;
                }
            }
            self.store
                .cancel_run(&run.id, "orphaned by service restart", now)
                .await?;
            report.cancelled_runs += 1;
            info!("Recovered orphaned run {}", run.id);
        }

        for pid in NativePlatform::find_pids_by_name(&self.builder_process_name) {
            if Self::kill_process(&pid) {
                report.killed += 1;
                info!("Killed untracked builder process {}", pid);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::types::RunStatus;

    #[tokio::test]
    async fn sweep_cancels_orphaned_runs() {
        let store = Arc::new(StateStore::open_in_memory());
        let supervisor = ProcessSupervisor::new(
            store.clone(),
            // A name no real process carries, so the OS scan finds nothing.
            "gameforge-test-no-such-tool".to_string(),
        );
        let now = now_ms();
        store.try_begin_run("run-a", now, 0, 10, false).await.unwrap();
        supervisor.track_process("run-a", 99_999_999).await.unwrap();

        let report = supervisor.sweep_orphans().await.unwrap();
        assert_eq!(report.cancelled_runs, 1);

        let run = store.get_run("run-a").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.error.as_deref(), Some("orphaned by service restart"));
    }

    #[tokio::test]
    async fn sweep_is_a_noop_with_nothing_active() {
        let store = Arc::new(StateStore::open_in_memory());
        let supervisor =
            ProcessSupervisor::new(store, "gameforge-test-no-such-tool".to_string());
        let report = supervisor.sweep_orphans().await.unwrap();
        assert_eq!(report.cancelled_runs, 0);
    }
}
