//! Durable history of evolution cycles. The as-of time of the last
//! committed cycle is the watermark for the next one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::outcome::store::{parse_ts, ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Committed,
    NoOp,
    Failed,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::NoOp => "no_op",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "committed" => Self::Committed,
            "failed" => Self::Failed,
            _ => Self::NoOp,
        }
    }
}

/// One row of cycle history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    #[serde(default)]
    pub id: i64,
    pub as_of: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub qualifying: usize,
    pub rejected: usize,
    pub pattern: Option<String>,
    pub version: Option<u64>,
    pub detail: String,
}

pub struct EvolutionLedger {
    conn: Mutex<Connection>,
}

impl EvolutionLedger {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;
        let db_path = data_dir.join("evolution.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open evolution ledger: {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS evolution_cycles (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                as_of       TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                status      TEXT NOT NULL,
                qualifying  INTEGER NOT NULL DEFAULT 0,
                rejected    INTEGER NOT NULL DEFAULT 0,
                pattern     TEXT,
                version     INTEGER,
                detail      TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_status ON evolution_cycles(status, as_of);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record(&self, cycle: &CycleRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO evolution_cycles
                (as_of, finished_at, status, qualifying, rejected, pattern, version, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ts(cycle.as_of),
                ts(cycle.finished_at),
                cycle.status.as_str(),
                i64::try_from(cycle.qualifying).unwrap_or(i64::MAX),
                i64::try_from(cycle.rejected).unwrap_or(i64::MAX),
                cycle.pattern,
                cycle.version.and_then(|v| i64::try_from(v).ok()),
                cycle.detail,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// As-of time of the latest committed cycle.
    pub fn watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(as_of) FROM evolution_cycles WHERE status = 'committed'",
            [],
            |row| row.get(0),
        )?;
        Ok(raw.as_deref().and_then(parse_ts))
    }

    /// Most recent cycles first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, as_of, finished_at, status, qualifying, rejected, pattern, version, detail
             FROM evolution_cycles ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            let as_of: String = row.get(1)?;
            let finished_at: String = row.get(2)?;
            Ok(CycleRecord {
                id: row.get(0)?,
                as_of: parse_ts(&as_of).unwrap_or_else(Utc::now),
                finished_at: parse_ts(&finished_at).unwrap_or_else(Utc::now),
                status: CycleStatus::from_str_lossy(&row.get::<_, String>(3)?),
                qualifying: usize::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
                rejected: usize::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
                pattern: row.get(6)?,
                version: row.get::<_, Option<i64>>(7)?.and_then(|v| u64::try_from(v).ok()),
                detail: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cycle(status: CycleStatus, as_of: DateTime<Utc>) -> CycleRecord {
        CycleRecord {
            id: 0,
            as_of,
            finished_at: Utc::now(),
            status,
            qualifying: 6,
            rejected: 3,
            pattern: Some("response_too_verbose".into()),
            version: (status == CycleStatus::Committed).then_some(2),
            detail: String::new(),
        }
    }

    #[test]
    fn watermark_tracks_committed_cycles_only() {
        let ledger = EvolutionLedger::in_memory().unwrap();
        assert!(ledger.watermark().unwrap().is_none());

        let t1 = Utc::now() - Duration::days(2);
        let t2 = Utc::now() - Duration::days(1);
        ledger.record(&cycle(CycleStatus::Committed, t1)).unwrap();
        ledger.record(&cycle(CycleStatus::NoOp, t2)).unwrap();
        ledger.record(&cycle(CycleStatus::Failed, t2)).unwrap();

        let watermark = ledger.watermark().unwrap().unwrap();
        assert_eq!(ts(watermark), ts(t1));
    }

    #[test]
    fn recent_lists_newest_first() {
        let ledger = EvolutionLedger::in_memory().unwrap();
        ledger.record(&cycle(CycleStatus::NoOp, Utc::now())).unwrap();
        ledger.record(&cycle(CycleStatus::Committed, Utc::now())).unwrap();

        let recent = ledger.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, CycleStatus::Committed);
        assert_eq!(recent[0].version, Some(2));
        assert_eq!(recent[1].status, CycleStatus::NoOp);
    }
}
