use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::ledger::Ledger;
use crate::core::config::WalletConfig;
use crate::core::store::types::WalletTier;
use crate::core::store::{StateStore, now_ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopUpOutcome {
    Transferred { amount: u64, tx_ref: String },
    NoActionNeeded,
    Denied { reason: String },
}

/// Governs fund flow across the three custody tiers: cold reserve, hot
/// operating wallet, and the single-purpose airlock used as a pass-through
/// for burn-style operations. Each wallet has exactly one signer mutex so
/// no two transfers from the same wallet are ever signed concurrently.
pub struct WalletTierManager {
    store: Arc<StateStore>,
    ledger: Arc<dyn Ledger>,
    config: WalletConfig,
    reserve_signer: Mutex<()>,
    hot_signer: Mutex<()>,
    airlock_signer: Mutex<()>,
}

impl WalletTierManager {
    pub fn new(store: Arc<StateStore>, ledger: Arc<dyn Ledger>, config: WalletConfig) -> Self {
        Self {
            store,
            ledger,
            config,
            reserve_signer: Mutex::new(()),
            hot_signer: Mutex::new(()),
            airlock_signer: Mutex::new(()),
        }
    }

    pub fn hot_address(&self) -> &str {
        &self.config.hot_address
    }

    /// Refill the hot wallet from reserve when it drops below the low-water
    /// mark. The daily moved-out cap is its own circuit breaker, independent
    /// from the payout breaker.
    pub async fn top_up_if_needed(&self) -> Result<TopUpOutcome> {
        let now = now_ms();
        let hot_balance = self
            .ledger
            .get_balance(&self.config.hot_address)
            .await
            .context("reading hot balance")?;
        self.store
            .upsert_wallet_snapshot(WalletTier::Hot, &self.config.hot_address, hot_balance, now)
            .await?;

        if hot_balance >= self.config.hot_low_water {
            return Ok(TopUpOutcome::NoActionNeeded);
        }

        let amount = self.config.hot_top_up_amount;
        let moved_today = self.store.reserve_moved_today(now).await?;
        if moved_today.saturating_add(amount) > self.config.reserve_daily_move_cap {
            warn!(
                "Hot wallet below low water but reserve daily move cap reached ({} + {} > {})",
                moved_today, amount, self.config.reserve_daily_move_cap
            );
            return Ok(TopUpOutcome::Denied {
                reason: format!(
                    "reserve daily move cap: {} moved + {} requested exceeds {}",
                    moved_today, amount, self.config.reserve_daily_move_cap
                ),
            });
        }

        let _signer = self.reserve_signer.lock().await;
        let tx_ref = self
            .ledger
            .transfer(&self.config.reserve_address, &self.config.hot_address, amount)
            .await
            .context("reserve -> hot top-up")?;
        self.store
            .add_reserve_moved(&self.config.reserve_address, amount, now)
            .await?;
        info!("Topped up hot wallet with {} units ({})", amount, tx_ref);
        Ok(TopUpOutcome::Transferred { amount, tx_ref })
    }

    /// Pay a winner from the hot wallet. Callers gate this through the
    /// circuit breaker first; this method only serializes signing and moves
    /// the funds.
    pub async fn transfer_payout(&self, to: &str, amount: u64) -> Result<String> {
        let _signer = self.hot_signer.lock().await;
        let tx_ref = self
            .ledger
            .transfer(&self.config.hot_address, to, amount)
            .await
            .context("hot -> winner payout")?;
        if let Ok(balance) = self.ledger.get_balance(&self.config.hot_address).await {
            self.store
                .upsert_wallet_snapshot(
                    WalletTier::Hot,
                    &self.config.hot_address,
                    balance,
                    now_ms(),
                )
                .await?;
        }
        Ok(tx_ref)
    }

    /// Route a burn through the airlock: reserve funds the airlock for the
    /// exact amount, then the airlock forwards to the burn sink. A fault in
    /// the burn path can drain at most the airlock's balance, never the
    /// reserve.
    pub async fn burn_via_airlock(&self, amount: u64) -> Result<String> {
        let now = now_ms();
        let moved_today = self.store.reserve_moved_today(now).await?;
        if moved_today.saturating_add(amount) > self.config.reserve_daily_move_cap {
            anyhow::bail!(
                "reserve daily move cap: {} moved + {} requested exceeds {}",
                moved_today,
                amount,
                self.config.reserve_daily_move_cap
            );
        }

        {
            let _signer = self.reserve_signer.lock().await;
            self.ledger
                .transfer(
                    &self.config.reserve_address,
                    &self.config.airlock_address,
                    amount,
                )
                .await
                .context("reserve -> airlock funding")?;
            self.store
                .add_reserve_moved(&self.config.reserve_address, amount, now)
                .await?;
        }

        let _signer = self.airlock_signer.lock().await;
        let tx_ref = self
            .ledger
            .transfer(
                &self.config.airlock_address,
                &self.config.burn_address,
                amount,
            )
            .await
            .context("airlock -> burn")?;
        info!("Burned {} units via airlock ({})", amount, tx_ref);
        Ok(tx_ref)
    }

    /// Refresh all tier snapshots from the ledger, for `/stats`.
    pub async fn sync_snapshots(&self) -> Result<()> {
        let now = now_ms();
        for (tier, address) in [
            (WalletTier::Reserve, &self.config.reserve_address),
            (WalletTier::Hot, &self.config.hot_address),
            (WalletTier::Airlock, &self.config.airlock_address),
        ] {
            match self.ledger.get_balance(address).await {
                Ok(balance) => {
                    self.store
                        .upsert_wallet_snapshot(tier, address, balance, now)
                        .await?;
                }
                Err(e) => warn!("Balance sync failed for {} wallet: {}", tier.as_str(), e),
            }
        }
        Ok(())
    }
}
