mod counters;
mod runs;
pub mod types;
mod wagers;
mod wallets;

pub use runs::RunStartOutcome;
pub use wagers::{CommitInsertOutcome, ProofConsumption};

#[cfg(test)]
pub(crate) use wagers::tests_support;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

/// Current wall-clock time as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// UTC calendar-day key ("2026-08-05") for the given Unix-millisecond time.
/// All daily counters roll over on this key.
pub fn day_key(at_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(at_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

/// Durable, transactional record of all entities. Single source of truth:
/// every check-then-mutate decision (run start, proof consumption, run
/// completion) happens inside one SQLite transaction here, never in memory.
pub struct StateStore {
    db: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(data_dir);

        let db_path = data_dir.join("brain.db");
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);

        Self::create_schema(&db)?;
        info!("State store opened at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store for tests; same schema, no files.
    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Self {
        let db = Connection::open_in_memory().expect("in-memory sqlite");
        Self::create_schema(&db).expect("schema");
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub(crate) fn handle(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    fn create_schema(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                phase INTEGER NOT NULL DEFAULT 0,
                builder_pid TEXT,
                error TEXT,
                slug TEXT,
                name TEXT,
                description TEXT,
                deploy_url TEXT,
                demo_mode INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                ended_at INTEGER
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS outcome_commitments (
                id TEXT PRIMARY KEY,
                requester TEXT NOT NULL,
                stake INTEGER NOT NULL,
                choice TEXT NOT NULL,
                secret TEXT NOT NULL,
                commitment_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                deposit_ref TEXT,
                payout_ref TEXT,
                result_choice TEXT,
                won INTEGER,
                payout INTEGER,
                payout_pending INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_commitments_requester
             ON outcome_commitments(requester, status)",
            [],
        )?;

        // Global replay guard: one row per deposit proof, ever.
        db.execute(
            "CREATE TABLE IF NOT EXISTS consumed_proofs (
                proof TEXT PRIMARY KEY,
                commitment_id TEXT NOT NULL,
                consumed_at INTEGER NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS pending_payouts (
                id TEXT PRIMARY KEY,
                commitment_id TEXT NOT NULL,
                requester TEXT NOT NULL,
                amount INTEGER NOT NULL,
                reason TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                released_at INTEGER
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS daily_counters (
                day TEXT PRIMARY KEY,
                runs_shipped INTEGER NOT NULL DEFAULT 0,
                last_run_end INTEGER,
                total_wagered INTEGER NOT NULL DEFAULT 0,
                total_payout INTEGER NOT NULL DEFAULT 0,
                wins INTEGER NOT NULL DEFAULT 0,
                losses INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS rate_limit_state (
                name TEXT PRIMARY KEY,
                day TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                last_event INTEGER
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS wallet_state (
                tier TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                synced_at INTEGER,
                moved_out_today INTEGER NOT NULL DEFAULT 0,
                moved_day TEXT
            )",
            [],
        )?;

        Ok(())
    }
}
