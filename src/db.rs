use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::liquidity::error::LiquidityError;
use crate::liquidity::swaps::{Action, SwapRecommendation};
use crate::liquidity::Suggestions;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Record the outcome of one suggestion cycle with its swaps.
    pub fn record_cycle(
        &self,
        at: DateTime<Utc>,
        outcome: &Result<Suggestions, LiquidityError>,
    ) -> anyhow::Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let at = timestamp(at);

        let cycle_id = match outcome {
            Ok(s) => {
                tx.execute(
                    "INSERT INTO suggestion_cycles
                        (started_at, outcome, loop_out_count, loop_in_count, dropped_count)
                     VALUES (?1, 'ok', ?2, ?3, ?4)",
                    params![
                        at,
                        s.loop_out.len() as i64,
                        s.loop_in.len() as i64,
                        s.dropped.len() as i64
                    ],
                )?;
                let cycle_id = tx.last_insert_rowid();

                let suggested = s
                    .loop_out
                    .iter()
                    .map(|r| (Action::LoopOut, r, "suggested", None))
                    .chain(s.loop_in.iter().map(|r| (Action::LoopIn, r, "suggested", None)))
                    .chain(
                        s.dropped
                            .iter()
                            .map(|d| (d.action, &d.recommendation, "dropped", Some(d.reason.to_string()))),
                    );

                for (action, recommendation, status, reason) in suggested {
                    insert_swap(&tx, cycle_id, action, recommendation, status, reason.as_deref())?;
                }
                cycle_id
            }
            Err(e) => {
                tx.execute(
                    "INSERT INTO suggestion_cycles (started_at, outcome, error)
                     VALUES (?1, 'error', ?2)",
                    params![at, e.to_string()],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.commit()?;
        Ok(cycle_id)
    }

    /// Totals over cycles started at or after `since`.
    pub fn summary(&self, since: DateTime<Utc>) -> anyhow::Result<CycleSummary> {
        let since = timestamp(since);

        let (cycles, failed_cycles, last_cycle_at): (i64, i64, Option<f64>) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN outcome = 'error' THEN 1 ELSE 0 END), 0),
                    MAX(started_at)
             FROM suggestion_cycles WHERE started_at >= ?1",
            [since],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let swap_totals = |action: &str, status: &str| -> anyhow::Result<(i64, i64)> {
            Ok(self.conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(s.amount_sats), 0)
                 FROM suggested_swaps s
                 JOIN suggestion_cycles c ON c.id = s.cycle_id
                 WHERE c.started_at >= ?1 AND s.action = ?2 AND s.status = ?3",
                params![since, action, status],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        };

        let (loop_out_count, loop_out_sats) = swap_totals("loop_out", "suggested")?;
        let (loop_in_count, loop_in_sats) = swap_totals("loop_in", "suggested")?;
        let (dropped_out, _) = swap_totals("loop_out", "dropped")?;
        let (dropped_in, _) = swap_totals("loop_in", "dropped")?;

        Ok(CycleSummary {
            cycles: cycles as u64,
            failed_cycles: failed_cycles as u64,
            loop_out_count: loop_out_count as u64,
            loop_out_sats: loop_out_sats as u64,
            loop_in_count: loop_in_count as u64,
            loop_in_sats: loop_in_sats as u64,
            dropped_count: (dropped_out + dropped_in) as u64,
            last_cycle_at,
        })
    }

    /// Error message of the most recent cycle, if it failed.
    pub fn last_error(&self) -> anyhow::Result<Option<String>> {
        let error: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT error FROM suggestion_cycles ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(error.flatten())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub loop_out_count: u64,
    pub loop_out_sats: u64,
    pub loop_in_count: u64,
    pub loop_in_sats: u64,
    pub dropped_count: u64,
    /// Unix seconds.
    pub last_cycle_at: Option<f64>,
}

fn timestamp(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::LoopOut => "loop_out",
        Action::LoopIn => "loop_in",
        Action::None => "none",
    }
}

fn insert_swap(
    conn: &Connection,
    cycle_id: i64,
    action: Action,
    recommendation: &SwapRecommendation,
    status: &str,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO suggested_swaps (cycle_id, action, channel_id, amount_sats, status, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            cycle_id,
            action_name(action),
            recommendation.channel.0.to_string(),
            recommendation.amount as i64,
            status,
            reason
        ],
    )?;
    Ok(())
}

const SCHEMA: &str = r#"
-- One row per suggestion cycle (audit trail)
CREATE TABLE IF NOT EXISTS suggestion_cycles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at REAL NOT NULL,
    outcome TEXT NOT NULL CHECK (outcome IN ('ok', 'error')),
    error TEXT,
    loop_out_count INTEGER NOT NULL DEFAULT 0,
    loop_in_count INTEGER NOT NULL DEFAULT 0,
    dropped_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_suggestion_cycles_started
    ON suggestion_cycles(started_at);

-- Swaps suggested or dropped in a cycle
CREATE TABLE IF NOT EXISTS suggested_swaps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cycle_id INTEGER NOT NULL REFERENCES suggestion_cycles(id),
    action TEXT NOT NULL CHECK (action IN ('loop_out', 'loop_in')),
    channel_id TEXT NOT NULL,
    amount_sats INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('suggested', 'dropped')),
    reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_suggested_swaps_cycle
    ON suggested_swaps(cycle_id);
"#;
