use anyhow::Result;
use std::sync::Arc;

use crate::core::config::WagerConfig;
use crate::core::store::{StateStore, day_key};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerDecision {
    Allowed,
    Denied { reason: String },
}

impl BreakerDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BreakerDecision::Allowed)
    }
}

/// Guards payouts. Both checks re-read live counters/balances at call time;
/// caching a verdict across an await boundary would let two concurrent
/// acceptances both pass a stale check.
pub struct CircuitBreaker {
    store: Arc<StateStore>,
    config: WagerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<StateStore>, config: WagerConfig) -> Self {
        Self { store, config }
    }

    /// Refuse a new commitment once today's settled net loss plus this bet's
    /// worst case would breach the daily cap.
    pub async fn check_acceptance(&self, worst_case_loss: u64, now: i64) -> Result<BreakerDecision> {
        let counters = self.store.counters_for_day(&day_key(now)).await?;
        let projected = counters.net_loss().saturating_add(worst_case_loss);
        if projected > self.config.daily_loss_cap {
            return Ok(BreakerDecision::Denied {
                reason: format!(
                    "daily loss cap: {} settled + {} worst case exceeds {}",
                    counters.net_loss(),
                    worst_case_loss,
                    self.config.daily_loss_cap
                ),
            });
        }
        Ok(BreakerDecision::Allowed)
    }

    /// Gate a single payout transfer after the outcome is already decided.
    /// A denial queues the payout for manual release; it never reverses the
    /// win/lose result.
    pub fn check_payout(&self, amount: u64, live_hot_balance: u64) -> BreakerDecision {
        if amount > self.config.payout_cap_per_tx {
            return BreakerDecision::Denied {
                reason: format!(
                    "payout {} exceeds per-operation cap {}",
                    amount, self.config.payout_cap_per_tx
                ),
            };
        }
        let spend_cap =
            (live_hot_balance as u128 * self.config.hot_spend_cap_bps as u128 / 10_000) as u64;
        if amount > spend_cap {
            return BreakerDecision::Denied {
                reason: format!(
                    "payout {} exceeds {}bps of hot balance {}",
                    amount, self.config.hot_spend_cap_bps, live_hot_balance
                ),
            };
        }
        BreakerDecision::Allowed
    }
}
