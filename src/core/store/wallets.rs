use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::{WalletSnapshot, WalletTier};
use super::{StateStore, day_key};

impl StateStore {
    /// Cache a ledger balance reading. Snapshots are observability only;
    /// payout-affecting decisions always re-verify against the ledger.
    pub async fn upsert_wallet_snapshot(
        &self,
        tier: WalletTier,
        address: &str,
        balance: u64,
        now: i64,
    ) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        db.execute(
            "INSERT INTO wallet_state (tier, address, balance, synced_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tier) DO UPDATE SET
                 address = ?2, balance = ?3, synced_at = ?4",
            params![tier.as_str(), address, balance as i64, now],
        )?;
        Ok(())
    }

    pub async fn wallet_snapshot(&self, tier: WalletTier) -> Result<Option<WalletSnapshot>> {
        let db = self.handle();
        let db = db.lock().await;
        let snapshot = db
            .query_row(
                "SELECT address, balance, synced_at FROM wallet_state WHERE tier = ?1",
                params![tier.as_str()],
                |row| {
                    Ok(WalletSnapshot {
                        tier,
                        address: row.get(0)?,
                        balance: row.get::<_, i64>(1)? as u64,
                        synced_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Total moved out of the reserve during the day containing `now`.
    pub async fn reserve_moved_today(&self, now: i64) -> Result<u64> {
        let db = self.handle();
        let db = db.lock().await;
        let row: Option<(Option<String>, i64)> = db
            .query_row(
                "SELECT moved_day, moved_out_today FROM wallet_state WHERE tier = 'reserve'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((Some(day), moved)) if day == day_key(now) => Ok(moved as u64),
            _ => Ok(0),
        }
    }

    /// Add to the reserve's daily moved-out total, resetting on date rollover.
    pub async fn add_reserve_moved(&self, address: &str, amount: u64, now: i64) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        let today = day_key(now);
        db.execute(
            "INSERT INTO wallet_state (tier, address, moved_out_today, moved_day)
             VALUES ('reserve', ?1, ?2, ?3)
             ON CONFLICT(tier) DO UPDATE SET
                 moved_out_today = CASE WHEN moved_day = ?3
                     THEN moved_out_today + ?2 ELSE ?2 END,
                 moved_day = ?3",
            params![address, amount as i64, today],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::now_ms;

    #[tokio::test]
    async fn reserve_daily_moved_total_resets_on_rollover() {
        let store = StateStore::open_in_memory();
        let now = now_ms();
        assert_eq!(store.reserve_moved_today(now).await.unwrap(), 0);

        store.add_reserve_moved("rsv", 500, now).await.unwrap();
        store.add_reserve_moved("rsv", 250, now + 1).await.unwrap();
        assert_eq!(store.reserve_moved_today(now + 2).await.unwrap(), 750);

        let tomorrow = now + 24 * 60 * 60 * 1000;
        assert_eq!(store.reserve_moved_today(tomorrow).await.unwrap(), 0);
        store.add_reserve_moved("rsv", 100, tomorrow).await.unwrap();
        assert_eq!(store.reserve_moved_today(tomorrow + 1).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn wallet_snapshots_round_trip() {
        let store = StateStore::open_in_memory();
        let now = now_ms();
        store
            .upsert_wallet_snapshot(WalletTier::Hot, "hot-addr", 1_000, now)
            .await
            .unwrap();
        store
            .upsert_wallet_snapshot(WalletTier::Hot, "hot-addr", 900, now + 5)
            .await
            .unwrap();

        let snapshot = store.wallet_snapshot(WalletTier::Hot).await.unwrap().unwrap();
        assert_eq!(snapshot.balance, 900);
        assert_eq!(snapshot.synced_at, Some(now + 5));
        assert!(store.wallet_snapshot(WalletTier::Airlock).await.unwrap().is_none());
    }
}
