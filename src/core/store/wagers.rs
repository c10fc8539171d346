use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{CommitmentStatus, OutcomeCommitment, PendingPayout, WagerChoice};
use super::{StateStore, day_key};

#[derive(Debug, Clone)]
pub enum CommitInsertOutcome {
    Created,
    PendingExists { commitment_id: String },
}

/// Result of the transactional deposit-proof consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofConsumption {
    Consumed,
    /// This commitment already consumed this exact proof (crash between
    /// consumption and resolution); resolution may proceed.
    AlreadyConsumedByThis,
    /// The proof was spent by a different commitment, ever. Hard reject.
    ReplayedByOther { commitment_id: String },
}

fn commitment_from_row(row: &Row<'_>) -> rusqlite::Result<OutcomeCommitment> {
    let choice: String = row.get(3)?;
    let status: String = row.get(6)?;
    let result_choice: Option<String> = row.get(10)?;
    Ok(OutcomeCommitment {
        id: row.get(0)?,
        requester: row.get(1)?,
        stake: row.get::<_, i64>(2)? as u64,
        choice: WagerChoice::from_choice(&choice).unwrap_or(WagerChoice::Heads),
        secret: row.get(4)?,
        commitment_hash: row.get(5)?,
        status: CommitmentStatus::from_status(&status).unwrap_or(CommitmentStatus::Expired),
        expires_at: row.get(7)?,
        deposit_ref: row.get(8)?,
        payout_ref: row.get(9)?,
        result_choice: result_choice.and_then(|c| WagerChoice::from_choice(&c)),
        won: row.get::<_, Option<i64>>(11)?.map(|w| w != 0),
        payout: row.get::<_, Option<i64>>(12)?.map(|p| p as u64),
        payout_pending: row.get::<_, i64>(13)? != 0,
        created_at: row.get(14)?,
        resolved_at: row.get(15)?,
    })
}

const COMMITMENT_COLUMNS: &str = "id, requester, stake, choice, secret, commitment_hash, status, \
                                  expires_at, deposit_ref, payout_ref, result_choice, won, \
                                  payout, payout_pending, created_at, resolved_at";

impl StateStore {
    /// Insert a fresh commitment, enforcing "at most one pending per
    /// requester" inside a single transaction. Stale pending commitments of
    /// the same requester are expired first rather than blocking a retry.
    pub async fn insert_commitment(
        &self,
        commitment: &OutcomeCommitment,
        now: i64,
    ) -> Result<CommitInsertOutcome> {
        let db = self.handle();
        let mut db = db.lock().await;
        let tx = db.transaction()?;

        tx.execute(
            "UPDATE outcome_commitments SET status = 'expired'
             WHERE requester = ?1 AND status = 'pending' AND expires_at < ?2",
            params![commitment.requester, now],
        )?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM outcome_commitments
                 WHERE requester = ?1 AND status = 'pending' LIMIT 1",
                params![commitment.requester],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(commitment_id) = existing {
            return Ok(CommitInsertOutcome::PendingExists { commitment_id });
        }

        tx.execute(
            "INSERT INTO outcome_commitments
                 (id, requester, stake, choice, secret, commitment_hash,
                  status, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                commitment.id,
                commitment.requester,
                commitment.stake as i64,
                commitment.choice.as_str(),
                commitment.secret,
                commitment.commitment_hash,
                CommitmentStatus::Pending.as_str(),
                commitment.expires_at,
                commitment.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(CommitInsertOutcome::Created)
    }

    pub async fn get_commitment(&self, id: &str) -> Result<Option<OutcomeCommitment>> {
        let db = self.handle();
        let db = db.lock().await;
        let commitment = db
            .query_row(
                &format!("SELECT {COMMITMENT_COLUMNS} FROM outcome_commitments WHERE id = ?1"),
                params![id],
                commitment_from_row,
            )
            .optional()?;
        Ok(commitment)
    }

    /// Consume a deposit proof for `commitment_id` and mark the commitment
    /// deposited, atomically. The `consumed_proofs` primary key is the global
    /// replay guard: a given proof is spendable exactly once, ever.
    pub async fn consume_proof(
        &self,
        commitment_id: &str,
        proof: &str,
        now: i64,
    ) -> Result<ProofConsumption> {
        let db = self.handle();
        let mut db = db.lock().await;
        let tx = db.transaction()?;

        let holder: Option<String> = tx
            .query_row(
                "SELECT commitment_id FROM consumed_proofs WHERE proof = ?1",
                params![proof],
                |row| row.get(0),
            )
            .optional()?;
        match holder {
            Some(holder) if holder == commitment_id => {
                return Ok(ProofConsumption::AlreadyConsumedByThis);
            }
            Some(holder) => {
                return Ok(ProofConsumption::ReplayedByOther {
                    commitment_id: holder,
                });
            }
            None => {}
        }

        tx.execute(
            "INSERT INTO consumed_proofs (proof, commitment_id, consumed_at)
             VALUES (?1, ?2, ?3)",
            params![proof, commitment_id, now],
        )?;
        tx.execute(
            "UPDATE outcome_commitments
             SET status = 'deposited', deposit_ref = ?2
             WHERE id = ?1",
            params![commitment_id, proof],
        )?;
        tx.commit()?;
        Ok(ProofConsumption::Consumed)
    }

    /// Claim the resolution of a commitment: flip it to `resolved`, settle
    /// the daily counters and, for a win, insert the pending-payout row, all
    /// in one transaction. Returns false when another resolve got there
    /// first (the guarded UPDATE matched nothing), which is how concurrent
    /// resolves of the same commitment collapse to a single settlement.
    /// Funds move only after a successful claim, so a crash can at worst
    /// leave a queued payout, never a paid-but-unrecorded one.
    pub async fn claim_resolution(
        &self,
        id: &str,
        result_choice: WagerChoice,
        won: bool,
        stake: u64,
        payout: u64,
        queued: Option<&PendingPayout>,
        now: i64,
    ) -> Result<bool> {
        let db = self.handle();
        let mut db = db.lock().await;
        let tx = db.transaction()?;
        let claimed = tx.execute(
            "UPDATE outcome_commitments
             SET status = 'resolved', result_choice = ?2, won = ?3, payout = ?4,
                 payout_pending = ?5, resolved_at = ?6
             WHERE id = ?1 AND status IN ('pending', 'deposited')",
            params![
                id,
                result_choice.as_str(),
                won as i64,
                payout as i64,
                won as i64,
                now
            ],
        )?;
        if claimed == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO daily_counters (day, total_wagered, total_payout, wins, losses)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(day) DO UPDATE SET
                 total_wagered = total_wagered + ?2,
                 total_payout = total_payout + ?3,
                 wins = wins + ?4,
                 losses = losses + ?5",
            params![
                day_key(now),
                stake as i64,
                payout as i64,
                won as i64,
                (!won) as i64
            ],
        )?;
        if let Some(payout_row) = queued {
            tx.execute(
                "INSERT INTO pending_payouts
                     (id, commitment_id, requester, amount, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    payout_row.id,
                    payout_row.commitment_id,
                    payout_row.requester,
                    payout_row.amount as i64,
                    payout_row.reason,
                    payout_row.created_at
                ],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Mark a claimed payout as executed: the commitment stops reporting
    /// `payout_pending` and the queued row is released, atomically.
    pub async fn finalize_payout(
        &self,
        commitment_id: &str,
        payout_row_id: &str,
        tx_ref: &str,
        now: i64,
    ) -> Result<()> {
        let db = self.handle();
        let mut db = db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "UPDATE outcome_commitments
             SET payout_ref = ?2, payout_pending = 0
             WHERE id = ?1",
            params![commitment_id, tx_ref],
        )?;
        tx.execute(
            "UPDATE pending_payouts SET released_at = ?2 WHERE id = ?1",
            params![payout_row_id, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replace the provisional queue reason with the actual denial.
    pub async fn update_pending_payout_reason(&self, id: &str, reason: &str) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        db.execute(
            "UPDATE pending_payouts SET reason = ?2 WHERE id = ?1",
            params![id, reason],
        )?;
        Ok(())
    }

    /// Lazily expire pending commitments past their TTL. Returns how many
    /// rows flipped; also run periodically by the sweep timer.
    pub async fn expire_stale_commitments(&self, now: i64) -> Result<usize> {
        let db = self.handle();
        let db = db.lock().await;
        let expired = db.execute(
            "UPDATE outcome_commitments SET status = 'expired'
             WHERE status = 'pending' AND expires_at < ?1",
            params![now],
        )?;
        Ok(expired)
    }

    /// Void pending commitments matching a requester identity or a
    /// commitment id. Deposited/resolved rows are never touched.
    pub async fn cancel_pending_commitments(&self, requester_or_id: &str) -> Result<usize> {
        let db = self.handle();
        let db = db.lock().await;
        let cancelled = db.execute(
            "UPDATE outcome_commitments SET status = 'expired'
             WHERE status = 'pending' AND (requester = ?1 OR id = ?1)",
            params![requester_or_id],
        )?;
        Ok(cancelled)
    }

    pub async fn unreleased_pending_payouts(&self) -> Result<Vec<PendingPayout>> {
        let db = self.handle();
        let db = db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, commitment_id, requester, amount, reason, created_at, released_at
             FROM pending_payouts WHERE released_at IS NULL ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingPayout {
                id: row.get(0)?,
                commitment_id: row.get(1)?,
                requester: row.get(2)?,
                amount: row.get::<_, i64>(3)? as u64,
                reason: row.get(4)?,
                created_at: row.get(5)?,
                released_at: row.get(6)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

/// Commitment builder shared by the store, breaker and engine tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub fn commitment(id: &str, requester: &str, stake: u64, now: i64) -> OutcomeCommitment {
        OutcomeCommitment {
            id: id.to_string(),
            requester: requester.to_string(),
            stake,
            choice: WagerChoice::Heads,
            secret: "aa".repeat(32),
            commitment_hash: "bb".repeat(32),
            status: CommitmentStatus::Pending,
            expires_at: now + 120_000,
            deposit_ref: None,
            payout_ref: None,
            result_choice: None,
            won: None,
            payout: None,
            payout_pending: false,
            created_at: now,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::now_ms;

    fn sample_commitment(id: &str, requester: &str, now: i64) -> OutcomeCommitment {
        tests_support::commitment(id, requester, 50_000_000, now)
    }

    #[tokio::test]
    async fn one_pending_commitment_per_requester() {
        let store = StateStore::open_in_memory();
        let now = now_ms();
        let first = sample_commitment("c1", "alice", now);
        assert!(matches!(
            store.insert_commitment(&first, now).await.unwrap(),
            CommitInsertOutcome::Created
        ));

        let second = sample_commitment("c2", "alice", now);
        match store.insert_commitment(&second, now).await.unwrap() {
            CommitInsertOutcome::PendingExists { commitment_id } => {
                assert_eq!(commitment_id, "c1")
            }
            other => panic!("expected PendingExists, got {:?}", other),
        }

        // A different requester is unaffected.
        let third = sample_commitment("c3", "bob", now);
        assert!(matches!(
            store.insert_commitment(&third, now).await.unwrap(),
            CommitInsertOutcome::Created
        ));
    }

    #[tokio::test]
    async fn stale_pending_commitment_is_expired_on_retry() {
        let store = StateStore::open_in_memory();
        let now = now_ms();
        let mut stale = sample_commitment("c1", "alice", now);
        stale.expires_at = now - 1;
        store.insert_commitment(&stale, now - 200_000).await.unwrap();

        let fresh = sample_commitment("c2", "alice", now);
        assert!(matches!(
            store.insert_commitment(&fresh, now).await.unwrap(),
            CommitInsertOutcome::Created
        ));
        let old = store.get_commitment("c1").await.unwrap().unwrap();
        assert_eq!(old.status, CommitmentStatus::Expired);
    }

    #[tokio::test]
    async fn proof_is_consumed_exactly_once_globally() {
        let store = StateStore::open_in_memory();
        let now = now_ms();
        store
            .insert_commitment(&sample_commitment("c1", "alice", now), now)
            .await
            .unwrap();
        store
            .insert_commitment(&sample_commitment("c2", "bob", now), now)
            .await
            .unwrap();

        assert_eq!(
            store.consume_proof("c1", "sig-123", now).await.unwrap(),
            ProofConsumption::Consumed
        );
        // The same commitment retrying after a crash is allowed through.
        assert_eq!(
            store.consume_proof("c1", "sig-123", now).await.unwrap(),
            ProofConsumption::AlreadyConsumedByThis
        );
        // Any other commitment presenting the proof is a replay.
        assert_eq!(
            store.consume_proof("c2", "sig-123", now).await.unwrap(),
            ProofConsumption::ReplayedByOther {
                commitment_id: "c1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn resolution_settles_daily_counters_and_claims_once() {
        let store = StateStore::open_in_memory();
        let now = now_ms();
        let commitment = sample_commitment("c1", "alice", now);
        store.insert_commitment(&commitment, now).await.unwrap();
        store.consume_proof("c1", "sig-1", now).await.unwrap();

        let queued = PendingPayout {
            id: "pp-1".to_string(),
            commitment_id: "c1".to_string(),
            requester: "alice".to_string(),
            amount: 97_000_000,
            reason: "pending transfer".to_string(),
            created_at: now,
            released_at: None,
        };
        let claimed = store
            .claim_resolution(
                "c1",
                WagerChoice::Heads,
                true,
                commitment.stake,
                97_000_000,
                Some(&queued),
                now,
            )
            .await
            .unwrap();
        assert!(claimed);

        // A competing resolve loses the claim and must replay the stored
        // result instead of settling again.
        let second = store
            .claim_resolution(
                "c1",
                WagerChoice::Heads,
                true,
                commitment.stake,
                97_000_000,
                None,
                now + 1,
            )
            .await
            .unwrap();
        assert!(!second);

        let resolved = store.get_commitment("c1").await.unwrap().unwrap();
        assert_eq!(resolved.status, CommitmentStatus::Resolved);
        assert_eq!(resolved.won, Some(true));
        assert_eq!(resolved.payout, Some(97_000_000));
        assert!(resolved.payout_pending);

        let counters = store.counters_for_day(&day_key(now)).await.unwrap();
        assert_eq!(counters.total_wagered, 50_000_000);
        assert_eq!(counters.total_payout, 97_000_000);
        assert_eq!(counters.wins, 1);
        assert_eq!(counters.losses, 0);
        assert_eq!(counters.net_loss(), 47_000_000);

        // Executing the payout releases the queued row and clears the flag.
        assert_eq!(store.unreleased_pending_payouts().await.unwrap().len(), 1);
        store
            .finalize_payout("c1", "pp-1", "payout-tx-1", now + 2)
            .await
            .unwrap();
        let resolved = store.get_commitment("c1").await.unwrap().unwrap();
        assert!(!resolved.payout_pending);
        assert_eq!(resolved.payout_ref.as_deref(), Some("payout-tx-1"));
        assert!(store.unreleased_pending_payouts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_rows() {
        let store = StateStore::open_in_memory();
        let now = now_ms();
        store
            .insert_commitment(&sample_commitment("c1", "alice", now), now)
            .await
            .unwrap();
        store.consume_proof("c1", "sig-1", now).await.unwrap();

        // Deposited: cancel must not void it.
        assert_eq!(store.cancel_pending_commitments("alice").await.unwrap(), 0);
        assert_eq!(store.cancel_pending_commitments("c1").await.unwrap(), 0);

        store
            .insert_commitment(&sample_commitment("c2", "carol", now), now)
            .await
            .unwrap();
        assert_eq!(store.cancel_pending_commitments("c2").await.unwrap(), 1);
    }
}
