use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{Phase, Run, RunStatus};
use super::{StateStore, day_key};

/// Result of the atomic "no active run AND cooldown elapsed" check-and-insert.
#[derive(Debug, Clone)]
pub enum RunStartOutcome {
    Started(Run),
    AlreadyActive { run_id: String },
    CoolingDown { remaining_ms: i64 },
    DailyCapReached { cap: u32 },
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(1)?;
    Ok(Run {
        id: row.get(0)?,
        status: RunStatus::from_status(&status).unwrap_or(RunStatus::Cancelled),
        phase: row.get(2)?,
        builder_pid: row.get(3)?,
        error: row.get(4)?,
        slug: row.get(5)?,
        name: row.get(6)?,
        description: row.get(7)?,
        deploy_url: row.get(8)?,
        demo_mode: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
        ended_at: row.get(11)?,
    })
}

const RUN_COLUMNS: &str = "id, status, phase, builder_pid, error, slug, name, description, \
                           deploy_url, demo_mode, created_at, ended_at";

impl StateStore {
    /// Atomically create a new run, unless one is active or throttled.
    /// The existence check, the cooldown check and the insert share one
    /// transaction so two concurrent triggers cannot both succeed.
    pub async fn try_begin_run(
        &self,
        id: &str,
        now: i64,
        cooldown_ms: i64,
        max_per_day: u32,
        force: bool,
    ) -> Result<RunStartOutcome> {
        let db = self.handle();
        let mut db = db.lock().await;
        let tx = db.transaction()?;

        let active: Option<String> = tx
            .query_row(
                "SELECT id FROM runs WHERE status IN ('planning', 'executing') LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(run_id) = active {
            return Ok(RunStartOutcome::AlreadyActive { run_id });
        }

        if !force {
            let today = day_key(now);
            let started_today: u32 = tx.query_row(
                "SELECT COUNT(*) FROM runs
                 WHERE strftime('%Y-%m-%d', created_at / 1000, 'unixepoch') = ?1",
                params![today],
                |row| row.get(0),
            )?;
            if started_today >= max_per_day {
                return Ok(RunStartOutcome::DailyCapReached { cap: max_per_day });
            }

            // Spacing is measured from the *start* of the previous run so
            // overlapping long runs cannot bypass it.
            let last_start: Option<i64> =
                tx.query_row("SELECT MAX(created_at) FROM runs", [], |row| row.get(0))?;
            if let Some(last_start) = last_start {
                let elapsed = now - last_start;
                if elapsed < cooldown_ms {
                    return Ok(RunStartOutcome::CoolingDown {
                        remaining_ms: cooldown_ms - elapsed,
                    });
                }
            }
        }

        tx.execute(
            "INSERT INTO runs (id, status, phase, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, RunStatus::Planning.as_str(), 0, now],
        )?;
        tx.commit()?;

        Ok(RunStartOutcome::Started(Run {
            id: id.to_string(),
            status: RunStatus::Planning,
            phase: 0,
            builder_pid: None,
            error: None,
            slug: None,
            name: None,
            description: None,
            deploy_url: None,
            demo_mode: false,
            created_at: now,
            ended_at: None,
        }))
    }

    pub async fn active_run(&self) -> Result<Option<Run>> {
        let db = self.handle();
        let db = db.lock().await;
        let run = db
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE status IN ('planning', 'executing')
                     ORDER BY created_at DESC LIMIT 1"
                ),
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let db = self.handle();
        let db = db.lock().await;
        let run = db
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub async fn latest_run(&self) -> Result<Option<Run>> {
        let db = self.handle();
        let db = db.lock().await;
        let run = db
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC LIMIT 1"),
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Persist the phase the run has advanced to; also flips the status from
    /// `planning` to `executing` the first time real work starts. Returns
    /// false when the run is no longer active (cancelled underneath the
    /// pipeline), so callers stop progressing.
    pub async fn set_run_phase(&self, id: &str, phase: Phase) -> Result<bool> {
        let db = self.handle();
        let db = db.lock().await;
        let updated = db.execute(
            "UPDATE runs SET phase = ?2, status = ?3
             WHERE id = ?1 AND status IN ('planning', 'executing')",
            params![id, phase.index(), RunStatus::Executing.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub async fn set_run_builder_pid(&self, id: &str, pid: Option<&str>) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        db.execute(
            "UPDATE runs SET builder_pid = ?2 WHERE id = ?1",
            params![id, pid],
        )?;
        Ok(())
    }

    pub async fn set_run_artifact(
        &self,
        id: &str,
        slug: &str,
        name: &str,
        description: &str,
    ) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        db.execute(
            "UPDATE runs SET slug = ?2, name = ?3, description = ?4 WHERE id = ?1",
            params![id, slug, name, description],
        )?;
        Ok(())
    }

    pub async fn set_run_deploy_url(&self, id: &str, url: &str) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        db.execute(
            "UPDATE runs SET deploy_url = ?2 WHERE id = ?1",
            params![id, url],
        )?;
        Ok(())
    }

    pub async fn set_run_demo_mode(&self, id: &str) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        db.execute("UPDATE runs SET demo_mode = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Close out a successful run: final status, ended timestamp and the
    /// daily ship counter move in one transaction.
    pub async fn finish_run_completed(&self, id: &str, now: i64) -> Result<()> {
        let db = self.handle();
        let mut db = db.lock().await;
        let tx = db.transaction()?;
        let updated = tx.execute(
            "UPDATE runs SET status = ?2, phase = ?3, ended_at = ?4
             WHERE id = ?1 AND status IN ('planning', 'executing')",
            params![
                id,
                RunStatus::Completed.as_str(),
                Phase::DONE_INDEX,
                now
            ],
        )?;
        if updated == 0 {
            // Cancelled underneath us: leave the counters untouched.
            return Ok(());
        }
        tx.execute(
            "INSERT INTO daily_counters (day, runs_shipped, last_run_end)
             VALUES (?1, 1, ?2)
             ON CONFLICT(day) DO UPDATE SET
                 runs_shipped = runs_shipped + 1,
                 last_run_end = ?2",
            params![day_key(now), now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a run cancelled with an explicit reason. Returns false if the run
    /// was not active (already closed or unknown).
    pub async fn cancel_run(&self, id: &str, reason: &str, now: i64) -> Result<bool> {
        let db = self.handle();
        let db = db.lock().await;
        let updated = db.execute(
            "UPDATE runs SET status = ?2, error = ?3, ended_at = ?4
             WHERE id = ?1 AND status IN ('planning', 'executing')",
            params![id, RunStatus::Cancelled.as_str(), reason, now],
        )?;
        Ok(updated > 0)
    }

    pub async fn fail_run(&self, id: &str, phase: Phase, error: &str, now: i64) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        db.execute(
            "UPDATE runs SET status = ?2, error = ?3, ended_at = ?4
             WHERE id = ?1 AND status IN ('planning', 'executing')",
            params![
                id,
                RunStatus::Cancelled.as_str(),
                format!("{}: {}", phase.as_str(), error),
                now
            ],
        )?;
        Ok(())
    }

    /// Runs left in an active status by a previous process, for the startup
    /// recovery sweep.
    pub async fn orphaned_active_runs(&self) -> Result<Vec<Run>> {
        let db = self.handle();
        let db = db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ('planning', 'executing')"
        ))?;
        let rows = stmt.query_map([], run_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn runs_started_on(&self, day: &str) -> Result<u32> {
        let db = self.handle();
        let db = db.lock().await;
        let count = db.query_row(
            "SELECT COUNT(*) FROM runs
             WHERE strftime('%Y-%m-%d', created_at / 1000, 'unixepoch') = ?1",
            params![day],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn last_run_start(&self) -> Result<Option<i64>> {
        let db = self.handle();
        let db = db.lock().await;
        let last = db.query_row("SELECT MAX(created_at) FROM runs", [], |row| row.get(0))?;
        Ok(last)
    }
}
