use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct DepositCheck {
    pub valid: bool,
    pub error: Option<String>,
}

/// Minimal contract against the external ledger. Wallet balances read
/// through here are the authority for every payout-affecting decision;
/// StateStore snapshots are display-only.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Check that `proof` references a finalized transfer of exactly
    /// `expected_amount` to `expected_to`.
    async fn verify_deposit(
        &self,
        proof: &str,
        expected_to: &str,
        expected_amount: u64,
    ) -> Result<DepositCheck>;

    /// Move funds and return the ledger's transaction reference.
    async fn transfer(&self, from: &str, to: &str, amount: u64) -> Result<String>;

    async fn get_balance(&self, wallet: &str) -> Result<u64>;
}

/// HTTP-backed ledger client. The remote service owns keys and signing;
/// this process only ever names wallets by address.
pub struct RpcLedger {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TransferResponse {
    tx_ref: String,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: u64,
}

impl RpcLedger {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn verify_deposit(
        &self,
        proof: &str,
        expected_to: &str,
        expected_amount: u64,
    ) -> Result<DepositCheck> {
        let response: VerifyResponse = self
            .client
            .post(self.url("verify-deposit"))
            .json(&serde_json::json!({
                "proof": proof,
                "to": expected_to,
                "amount": expected_amount,
            }))
            .send()
            .await
            .context("ledger verify-deposit request")?
            .error_for_status()?
            .json()
            .await
            .context("ledger verify-deposit response")?;
        Ok(DepositCheck {
            valid: response.valid,
            error: response.error,
        })
    }

    async fn transfer(&self, from: &str, to: &str, amount: u64) -> Result<String> {
        let response: TransferResponse = self
            .client
            .post(self.url("transfer"))
            .json(&serde_json::json!({
                "from": from,
                "to": to,
                "amount": amount,
            }))
            .send()
            .await
            .context("ledger transfer request")?
            .error_for_status()?
            .json()
            .await
            .context("ledger transfer response")?;
        Ok(response.tx_ref)
    }

    async fn get_balance(&self, wallet: &str) -> Result<u64> {
        let response: BalanceResponse = self
            .client
            .get(self.url("balance"))
            .query(&[("wallet", wallet)])
            .send()
            .await
            .context("ledger balance request")?
            .error_for_status()?
            .json()
            .await
            .context("ledger balance response")?;
        Ok(response.balance)
    }
}

/// Placeholder used when no ledger endpoint is configured. Every call fails
/// loudly so a misconfigured deployment cannot quietly fake fund movement.
pub struct UnconfiguredLedger;

#[async_trait]
impl Ledger for UnconfiguredLedger {
    async fn verify_deposit(&self, _: &str, _: &str, _: u64) -> Result<DepositCheck> {
        Err(anyhow!("no ledger endpoint configured"))
    }

    async fn transfer(&self, _: &str, _: &str, _: u64) -> Result<String> {
        Err(anyhow!("no ledger endpoint configured"))
    }

    async fn get_balance(&self, _: &str) -> Result<u64> {
        Err(anyhow!("no ledger endpoint configured"))
    }
}
