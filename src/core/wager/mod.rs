mod breaker;
mod ledger;
mod wallets;

pub use breaker::{BreakerDecision, CircuitBreaker};
pub use ledger::{DepositCheck, Ledger, RpcLedger, UnconfiguredLedger};
pub use wallets::{TopUpOutcome, WalletTierManager};

#[cfg(test)]
pub(crate) use ledger::testing;

use anyhow::{Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::WagerConfig;
use crate::core::store::types::{
    CommitmentStatus, OutcomeCommitment, PendingPayout, WagerChoice,
};
use crate::core::store::{ProofConsumption, StateStore, now_ms};

/// Binding commitment to a secret: published before any deposit is seen.
pub fn commitment_hash(secret: &[u8]) -> String {
    hex::encode(Sha256::digest(secret))
}

/// The outcome combines the server secret (fixed at commit time) with the
/// depositor-controlled proof (unpredictable until submitted), so neither
/// party can steer the result.
pub fn outcome_choice(secret: &[u8], proof: &str) -> WagerChoice {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(proof.as_bytes());
    let digest = hasher.finalize();
    if digest[0] < 0x80 {
        WagerChoice::Heads
    } else {
        WagerChoice::Tails
    }
}

pub fn winning_payout(stake: u64, multiplier_bps: u32) -> u64 {
    (stake as u128 * multiplier_bps as u128 / 10_000) as u64
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommitTicket {
    pub commitment_id: String,
    pub commitment_hash: String,
    pub deposit_address: String,
    pub deposit_amount: u64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub enum CommitRejection {
    InvalidStake { min: u64, max: u64 },
    PendingExists { commitment_id: String },
    BreakerTripped { reason: String },
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Accepted(CommitTicket),
    Rejected(CommitRejection),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Resolution {
    pub commitment_id: String,
    pub result: WagerChoice,
    pub won: bool,
    pub payout: u64,
    pub payout_ref: Option<String>,
    pub payout_pending: bool,
    /// Revealed server secret; clients can recheck both hashes offline.
    pub secret: String,
    pub commitment_hash: String,
    pub already_resolved: bool,
}

#[derive(Debug, Clone)]
pub enum ResolveRejection {
    NotFound,
    Expired,
    VerificationFailed { detail: String },
    ProofReplayed { holder: String },
}

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Resolved(Resolution),
    Rejected(ResolveRejection),
}

/// Two-phase commit-reveal engine for the wagering feature. All state lives
/// in the StateStore; the engine is stateless between calls and safe to
/// share behind an Arc.
pub struct CommitRevealEngine {
    store: Arc<StateStore>,
    ledger: Arc<dyn Ledger>,
    wallets: Arc<WalletTierManager>,
    breaker: CircuitBreaker,
    config: WagerConfig,
}

impl CommitRevealEngine {
    pub fn new(
        store: Arc<StateStore>,
        ledger: Arc<dyn Ledger>,
        wallets: Arc<WalletTierManager>,
        config: WagerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(store.clone(), config.clone());
        Self {
            store,
            ledger,
            wallets,
            breaker,
            config,
        }
    }

    /// Issue a commitment: sample the secret, publish its hash and the
    /// deposit instructions. The stake is escrowed by the requester paying
    /// the hot wallet; nothing moves server-side yet.
    pub async fn commit(
        &self,
        requester: &str,
        stake: u64,
        choice: WagerChoice,
    ) -> Result<CommitOutcome> {
        let now = now_ms();
        if stake < self.config.min_stake || stake > self.config.max_stake {
            return Ok(CommitOutcome::Rejected(CommitRejection::InvalidStake {
                min: self.config.min_stake,
                max: self.config.max_stake,
            }));
        }

        let payout = winning_payout(stake, self.config.payout_multiplier_bps);
        let worst_case_loss = payout.saturating_sub(stake);
        match self.breaker.check_acceptance(worst_case_loss, now).await? {
            BreakerDecision::Allowed => {}
            BreakerDecision::Denied { reason } => {
                return Ok(CommitOutcome::Rejected(CommitRejection::BreakerTripped {
                    reason,
                }));
            }
        }

        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let hash = commitment_hash(&secret);

        let commitment = OutcomeCommitment {
            id: Uuid::new_v4().to_string(),
            requester: requester.to_string(),
            stake,
            choice,
            secret: hex::encode(secret),
            commitment_hash: hash.clone(),
            status: CommitmentStatus::Pending,
            expires_at: now + self.config.commitment_ttl_ms,
            deposit_ref: None,
            payout_ref: None,
            result_choice: None,
            won: None,
            payout: None,
            payout_pending: false,
            created_at: now,
            resolved_at: None,
        };

        match self.store.insert_commitment(&commitment, now).await? {
            crate::core::store::CommitInsertOutcome::PendingExists { commitment_id } => {
                Ok(CommitOutcome::Rejected(CommitRejection::PendingExists {
                    commitment_id,
                }))
            }
            crate::core::store::CommitInsertOutcome::Created => {
                info!(
                    "Issued commitment {} for {} (stake {})",
                    commitment.id, requester, stake
                );
                Ok(CommitOutcome::Accepted(CommitTicket {
                    commitment_id: commitment.id,
                    commitment_hash: hash,
                    deposit_address: self.wallets.hot_address().to_string(),
                    deposit_amount: stake,
                    expires_at: commitment.expires_at,
                }))
            }
        }
    }

    /// Resolve a commitment against a deposit proof. Idempotent: a resolved
    /// commitment replays its original result without recomputation.
    pub async fn resolve(&self, commitment_id: &str, proof: &str) -> Result<ResolveOutcome> {
        let now = now_ms();
        let Some(commitment) = self.store.get_commitment(commitment_id).await? else {
            return Ok(ResolveOutcome::Rejected(ResolveRejection::NotFound));
        };

        match commitment.status {
            CommitmentStatus::Resolved => Ok(ResolveOutcome::Resolved(
                Self::stored_resolution(&commitment),
            )),
            CommitmentStatus::Expired => {
                Ok(ResolveOutcome::Rejected(ResolveRejection::Expired))
            }
            CommitmentStatus::Pending if now > commitment.expires_at => {
                self.store.expire_stale_commitments(now).await?;
                Ok(ResolveOutcome::Rejected(ResolveRejection::Expired))
            }
            CommitmentStatus::Pending => {
                let check = self
                    .ledger
                    .verify_deposit(proof, self.wallets.hot_address(), commitment.stake)
                    .await
                    .context("deposit verification")?;
                if !check.valid {
                    // Nothing consumed: the commitment stays pending and can
                    // be retried with a fresh proof until it expires.
                    return Ok(ResolveOutcome::Rejected(
                        ResolveRejection::VerificationFailed {
                            detail: check
                                .error
                                .unwrap_or_else(|| "deposit does not match".to_string()),
                        },
                    ));
                }
                match self.store.consume_proof(commitment_id, proof, now).await? {
                    ProofConsumption::ReplayedByOther { commitment_id: holder } => Ok(
                        ResolveOutcome::Rejected(ResolveRejection::ProofReplayed { holder }),
                    ),
                    ProofConsumption::Consumed | ProofConsumption::AlreadyConsumedByThis => {
                        self.settle(&commitment, proof, now).await
                    }
                }
            }
            CommitmentStatus::Deposited => {
                // A previous attempt consumed the deposit but crashed before
                // recording the outcome. Settle from the stored proof; the
                // computation is deterministic so the result is unchanged.
                let stored_proof = commitment
                    .deposit_ref
                    .clone()
                    .unwrap_or_else(|| proof.to_string());
                self.settle(&commitment, &stored_proof, now).await
            }
        }
    }

    /// Void pending commitments for a requester identity or commitment id.
    pub async fn cancel(&self, requester_or_id: &str) -> Result<usize> {
        self.store.cancel_pending_commitments(requester_or_id).await
    }

    pub async fn commitment(&self, id: &str) -> Result<Option<OutcomeCommitment>> {
        self.store.get_commitment(id).await
    }

    async fn settle(
        &self,
        commitment: &OutcomeCommitment,
        proof: &str,
        now: i64,
    ) -> Result<ResolveOutcome> {
        let secret = hex::decode(&commitment.secret).context("stored secret not hex")?;
        let result = outcome_choice(&secret, proof);
        let won = result == commitment.choice;
        let payout = if won {
            winning_payout(commitment.stake, self.config.payout_multiplier_bps)
        } else {
            0
        };

        // Claim the outcome before any funds move. If the claim fails, a
        // concurrent resolve already settled this commitment; replay it.
        let queued = (won && payout > 0).then(|| PendingPayout {
            id: Uuid::new_v4().to_string(),
            commitment_id: commitment.id.clone(),
            requester: commitment.requester.clone(),
            amount: payout,
            reason: "pending transfer".to_string(),
            created_at: now,
            released_at: None,
        });
        let claimed = self
            .store
            .claim_resolution(
                &commitment.id,
                result,
                won,
                commitment.stake,
                payout,
                queued.as_ref(),
                now,
            )
            .await?;
        if !claimed {
            let Some(settled) = self.store.get_commitment(&commitment.id).await? else {
                anyhow::bail!("commitment {} vanished during resolution", commitment.id);
            };
            return Ok(ResolveOutcome::Resolved(Self::stored_resolution(&settled)));
        }

        // Only now move the funds. A crash or denial from here on leaves the
        // payout queued for manual release, never unpaid-and-unrecorded.
        let mut payout_ref = None;
        let mut payout_pending = false;
        if let Some(payout_row) = &queued {
            match self.gated_payout(commitment, payout).await {
                Ok(tx_ref) => {
                    self.store
                        .finalize_payout(&commitment.id, &payout_row.id, &tx_ref, now)
                        .await?;
                    payout_ref = Some(tx_ref);
                }
                Err(reason) => {
                    // The outcome stands; only the fund movement is deferred.
                    warn!(
                        "Queued payout of {} for commitment {}: {}",
                        payout, commitment.id, reason
                    );
                    self.store
                        .update_pending_payout_reason(&payout_row.id, &reason)
                        .await?;
                    payout_pending = true;
                }
            }
        }

        Ok(ResolveOutcome::Resolved(Resolution {
            commitment_id: commitment.id.clone(),
            result,
            won,
            payout,
            payout_ref,
            payout_pending,
            secret: commitment.secret.clone(),
            commitment_hash: commitment.commitment_hash.clone(),
            already_resolved: false,
        }))
    }

    /// Run the payout gate against the live hot balance and, if allowed,
    /// move the funds. Any denial or failure is returned as the queue reason.
    async fn gated_payout(
        &self,
        commitment: &OutcomeCommitment,
        payout: u64,
    ) -> std::result::Result<String, String> {
        let balance = self
            .ledger
            .get_balance(self.wallets.hot_address())
            .await
            .map_err(|e| format!("hot balance unavailable: {e:#}"))?;
        match self.breaker.check_payout(payout, balance) {
            BreakerDecision::Allowed => self
                .wallets
                .transfer_payout(&commitment.requester, payout)
                .await
                .map_err(|e| format!("transfer failed: {e:#}")),
            BreakerDecision::Denied { reason } => Err(reason),
        }
    }

    fn stored_resolution(commitment: &OutcomeCommitment) -> Resolution {
        Resolution {
            commitment_id: commitment.id.clone(),
            result: commitment.result_choice.unwrap_or(commitment.choice),
            won: commitment.won.unwrap_or(false),
            payout: commitment.payout.unwrap_or(0),
            payout_ref: commitment.payout_ref.clone(),
            payout_pending: commitment.payout_pending,
            secret: commitment.secret.clone(),
            commitment_hash: commitment.commitment_hash.clone(),
            already_resolved: true,
        }
    }
}
