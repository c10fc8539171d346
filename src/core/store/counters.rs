use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use super::types::DailyCounters;
use super::{StateStore, day_key};

const ANNOUNCE_LIMITER: &str = "announcements";

impl StateStore {
    /// Counters for one calendar day; absent rows read as all-zero.
    pub async fn counters_for_day(&self, day: &str) -> Result<DailyCounters> {
        let db = self.handle();
        let db = db.lock().await;
        let counters = db
            .query_row(
                "SELECT day, runs_shipped, last_run_end, total_wagered, total_payout,
                        wins, losses
                 FROM daily_counters WHERE day = ?1",
                params![day],
                |row| {
                    Ok(DailyCounters {
                        day: row.get(0)?,
                        runs_shipped: row.get(1)?,
                        last_run_end: row.get(2)?,
                        total_wagered: row.get::<_, i64>(3)? as u64,
                        total_payout: row.get::<_, i64>(4)? as u64,
                        wins: row.get(5)?,
                        losses: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(counters.unwrap_or_else(|| DailyCounters {
            day: day.to_string(),
            ..Default::default()
        }))
    }

    /// Announcement limiter state for the day containing `now`: (count so
    /// far, last announcement time). A row from a previous day reads as zero.
    pub async fn announce_state(&self, now: i64) -> Result<(u32, Option<i64>)> {
        let db = self.handle();
        let db = db.lock().await;
        let row: Option<(String, u32, Option<i64>)> = db
            .query_row(
                "SELECT day, count, last_event FROM rate_limit_state WHERE name = ?1",
                params![ANNOUNCE_LIMITER],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some((day, count, last_event)) if day == day_key(now) => Ok((count, last_event)),
            // Date rolled over (or never announced): count resets, the last
            // event time still bounds the minimum interval.
            Some((_, _, last_event)) => Ok((0, last_event)),
            None => Ok((0, None)),
        }
    }

    pub async fn record_announcement(&self, now: i64) -> Result<()> {
        let db = self.handle();
        let db = db.lock().await;
        let today = day_key(now);
        db.execute(
            "INSERT INTO rate_limit_state (name, day, count, last_event)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(name) DO UPDATE SET
                 count = CASE WHEN day = ?2 THEN count + 1 ELSE 1 END,
                 day = ?2,
                 last_event = ?3",
            params![ANNOUNCE_LIMITER, today, now],
        )?;
        Ok(())
    }
}
