use anyhow::Result;
use std::sync::Arc;

use crate::core::config::{AnnouncerConfig, PipelineConfig};
use crate::core::store::{StateStore, day_key};

/// Outcome of a rate-limit check. `retry_after_ms` is set when the caller
/// can simply wait the denial out.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "gate")]
pub enum Gate {
    Allowed,
    Denied {
        reason: String,
        retry_after_ms: Option<i64>,
    },
}

impl Gate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Gate::Allowed)
    }
}

/// Daily quotas and minimum spacing for two independent resources: pipeline
/// runs and external announcements. Pure reads over StateStore rows plus
/// wall-clock time; run-start *enforcement* stays inside the
/// `try_begin_run` transaction, these checks feed throttling responses and
/// the `/limits` endpoint.
pub struct RateLimiter {
    store: Arc<StateStore>,
    pipeline: PipelineConfig,
    announcer: AnnouncerConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<StateStore>, pipeline: PipelineConfig, announcer: AnnouncerConfig) -> Self {
        Self {
            store,
            pipeline,
            announcer,
        }
    }

    pub async fn can_run(&self, now: i64) -> Result<Gate> {
        let today = day_key(now);
        let started_today = self.store.runs_started_on(&today).await?;
        if started_today >= self.pipeline.max_runs_per_day {
            return Ok(Gate::Denied {
                reason: format!(
                    "run cap reached: {}/{} today",
                    started_today, self.pipeline.max_runs_per_day
                ),
                retry_after_ms: None,
            });
        }

        if let Some(last_start) = self.store.last_run_start().await? {
            let elapsed = now - last_start;
            if elapsed < self.pipeline.cooldown_ms {
                let remaining = self.pipeline.cooldown_ms - elapsed;
                return Ok(Gate::Denied {
                    reason: format!("cooling down, {}ms remaining", remaining),
                    retry_after_ms: Some(remaining),
                });
            }
        }
        Ok(Gate::Allowed)
    }

    pub async fn can_announce(&self, now: i64) -> Result<Gate> {
        let (count, last_event) = self.store.announce_state(now).await?;
        if count >= self.announcer.max_posts_per_day {
            return Ok(Gate::Denied {
                reason: format!(
                    "announcement cap reached: {}/{} today",
                    count, self.announcer.max_posts_per_day
                ),
                retry_after_ms: None,
            });
        }
        if let Some(last_event) = last_event {
            let elapsed = now - last_event;
            if elapsed < self.announcer.min_interval_ms {
                let remaining = self.announcer.min_interval_ms - elapsed;
                return Ok(Gate::Denied {
                    reason: format!("last announcement {}ms ago, spacing not met", elapsed),
                    retry_after_ms: Some(remaining),
                });
            }
        }
        Ok(Gate::Allowed)
    }

    pub async fn record_announcement(&self, now: i64) -> Result<()> {
        self.store.record_announcement(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::now_ms;

    fn limiter(store: Arc<StateStore>) -> RateLimiter {
        let pipeline = PipelineConfig {
            max_runs_per_day: 2,
            cooldown_ms: 60_000,
            ..Default::default()
        };
        let announcer = AnnouncerConfig {
            max_posts_per_day: 15,
            min_interval_ms: 30 * 60 * 1000,
            endpoint: None,
        };
        RateLimiter::new(store, pipeline, announcer)
    }

    #[tokio::test]
    async fn run_gate_reports_remaining_cooldown() {
        let store = Arc::new(StateStore::open_in_memory());
        let limiter = limiter(store.clone());
        let now = now_ms();

        assert!(limiter.can_run(now).await.unwrap().is_allowed());
        store.try_begin_run("run-a", now, 0, 10, false).await.unwrap();
        store.cancel_run("run-a", "test", now).await.unwrap();

        match limiter.can_run(now + 10_000).await.unwrap() {
            Gate::Denied { retry_after_ms, .. } => assert_eq!(retry_after_ms, Some(50_000)),
            Gate::Allowed => panic!("expected cooldown denial"),
        }
        assert!(limiter.can_run(now + 60_000).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn sixteenth_announcement_is_denied_with_count_and_cap() {
        let store = Arc::new(StateStore::open_in_memory());
        let limiter = limiter(store.clone());
        // Pin to shortly after UTC midnight so 15 spaced posts stay inside
        // one calendar day regardless of when the test runs.
        let mut now = (now_ms() / 86_400_000) * 86_400_000 + 600_000;

        for _ in 0..15 {
            assert!(limiter.can_announce(now).await.unwrap().is_allowed());
            limiter.record_announcement(now).await.unwrap();
            now += 31 * 60 * 1000;
        }
        match limiter.can_announce(now).await.unwrap() {
            Gate::Denied { reason, .. } => {
                assert!(reason.contains("15/15"), "reason was: {}", reason)
            }
            Gate::Allowed => panic!("16th announcement should be denied"),
        }
    }

    #[tokio::test]
    async fn announcement_spacing_is_enforced() {
        let store = Arc::new(StateStore::open_in_memory());
        let limiter = limiter(store.clone());
        let now = now_ms();

        limiter.record_announcement(now).await.unwrap();
        match limiter.can_announce(now + 60_000).await.unwrap() {
            Gate::Denied { retry_after_ms, .. } => {
                assert_eq!(retry_after_ms, Some(29 * 60 * 1000))
            }
            Gate::Allowed => panic!("spacing should deny"),
        }
        assert!(
            limiter
                .can_announce(now + 30 * 60 * 1000)
                .await
                .unwrap()
                .is_allowed()
        );
    }
}
