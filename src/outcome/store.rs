use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use uuid::Uuid;

use crate::directive::{Disposition, ExecutionPath, Intent, VerificationStatus};
use crate::error::{EngineError, EngineResult};

use super::cursor::{Checkpoint, OutcomeCursor};
use super::{OutcomeRecord, OutcomeSink};

const SELECT_COLUMNS: &str = "seq, directive_id, directive_text, path, intent, confidence,
    verification_status, latency_ms, content_summary, caveated, deep_attempts,
    instructions_version, disposition, edit_note, recorded_at, disposition_at";

/// Fixed-width UTC timestamps so text order equals time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ── SQLite store ────────────────────────────────────────────────

/// SQLite-backed outcome log.
///
/// Every statement runs under one short-lived connection lock; no lock is
/// held between calls, so cursors and concurrent appends interleave freely.
pub struct OutcomeLog {
    conn: Mutex<Connection>,
    grace_window: Duration,
}

impl OutcomeLog {
    pub fn open(data_dir: &Path, grace_window_hours: u32) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;
        let db_path = data_dir.join("outcomes.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open outcome log: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )?;

        Self::from_connection(conn, grace_window_hours)
    }

    /// In-memory log, for tests and one-shot CLI runs.
    pub fn in_memory(grace_window_hours: u32) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, grace_window_hours)
    }

    fn from_connection(conn: Connection, grace_window_hours: u32) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            grace_window: Duration::hours(i64::from(grace_window_hours)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS outcomes (
                seq                  INTEGER PRIMARY KEY AUTOINCREMENT,
                directive_id         TEXT NOT NULL UNIQUE,
                directive_text       TEXT NOT NULL,
                path                 TEXT NOT NULL,
                intent               TEXT NOT NULL,
                confidence           REAL NOT NULL,
                verification_status  TEXT NOT NULL,
                latency_ms           INTEGER NOT NULL,
                content_summary      TEXT NOT NULL DEFAULT '',
                caveated             INTEGER NOT NULL DEFAULT 0,
                deep_attempts        INTEGER NOT NULL DEFAULT 0,
                instructions_version INTEGER NOT NULL,
                disposition          TEXT NOT NULL DEFAULT 'unknown',
                edit_note            TEXT,
                recorded_at          TEXT NOT NULL,
                disposition_at       TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outcomes_recorded_at ON outcomes(recorded_at, seq);
            CREATE INDEX IF NOT EXISTS idx_outcomes_disposition_at ON outcomes(disposition_at);",
        )?;
        Ok(())
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Append one record atomically. Returns its sequence number, or the
    /// existing one when the directive was already logged.
    pub fn append(&self, record: &OutcomeRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO outcomes
                (directive_id, directive_text, path, intent, confidence, verification_status,
                 latency_ms, content_summary, caveated, deep_attempts, instructions_version,
                 disposition, edit_note, recorded_at, disposition_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(directive_id) DO NOTHING",
            params![
                record.directive_id.to_string(),
                record.directive_text,
                record.path.as_str(),
                record.intent.as_str(),
                record.confidence,
                record.verification_status.as_str(),
                i64::try_from(record.latency_ms).unwrap_or(i64::MAX),
                record.content_summary,
                record.caveated,
                record.deep_attempts,
                i64::try_from(record.instructions_version).unwrap_or(i64::MAX),
                record.disposition.as_str(),
                record.edit_note,
                ts(record.recorded_at),
                record.disposition_at.map(ts),
            ],
        )
        .context("Failed to append outcome record")?;

        let seq = conn.query_row(
            "SELECT seq FROM outcomes WHERE directive_id = ?1",
            params![record.directive_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    pub fn get(&self, directive_id: Uuid) -> Result<Option<OutcomeRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM outcomes WHERE directive_id = ?1");
        let record = conn
            .query_row(&sql, params![directive_id.to_string()], row_to_record)
            .optional()?;
        Ok(record)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM outcomes", [], |row| row.get(0))?)
    }

    // ── Disposition ─────────────────────────────────────────────

    pub fn update_disposition(
        &self,
        directive_id: Uuid,
        disposition: Disposition,
        edit_note: Option<&str>,
    ) -> EngineResult<()> {
        self.update_disposition_at(directive_id, disposition, edit_note, Utc::now())
    }

    /// Finalize a record's disposition as of `now`.
    ///
    /// Transitions happen once, from `unknown` to a terminal value, and only
    /// while `now` is inside the grace window after the record was written.
    pub fn update_disposition_at(
        &self,
        directive_id: Uuid,
        disposition: Disposition,
        edit_note: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if !disposition.is_terminal() {
            return Err(anyhow::anyhow!("disposition must be accepted or rejected").into());
        }
        let id = directive_id.to_string();
        let cutoff = ts(now - self.grace_window);
        let note = edit_note.map(str::trim).filter(|n| !n.is_empty());

        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE outcomes SET disposition = ?1, edit_note = ?2, disposition_at = ?3
                 WHERE directive_id = ?4 AND disposition = 'unknown' AND recorded_at >= ?5",
                params![disposition.as_str(), note, ts(now), id, cutoff],
            )
            .context("Failed to update disposition")?;
        if changed == 1 {
            return Ok(());
        }

        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT disposition, recorded_at FROM outcomes WHERE directive_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read disposition")?;

        match current {
            None => Err(EngineError::UnknownDirective(directive_id)),
            Some((d, _)) if Disposition::from_str_lossy(&d).is_terminal() => {
                Err(EngineError::DispositionFinal(directive_id))
            }
            Some(_) => Err(EngineError::DispositionWindowClosed(directive_id)),
        }
    }

    // ── Reading ─────────────────────────────────────────────────

    /// Lazy sequence of records written at or after `since`, oldest first.
    pub fn read_since(&self, since: DateTime<Utc>) -> OutcomeCursor<'_> {
        OutcomeCursor::new(self, Checkpoint::before(since))
    }

    /// Continue a sequence from a checkpoint taken earlier.
    pub fn resume(&self, checkpoint: Checkpoint) -> OutcomeCursor<'_> {
        OutcomeCursor::new(self, checkpoint)
    }

    /// One page of records strictly after `after` in (recorded_at, seq) order.
    pub(crate) fn page_after(&self, after: &Checkpoint, limit: usize) -> Result<Vec<OutcomeRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM outcomes
             WHERE recorded_at > ?1 OR (recorded_at = ?1 AND seq > ?2)
             ORDER BY recorded_at ASC, seq ASC
             LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                after.recorded_at,
                after.seq,
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            row_to_record,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

impl OutcomeSink for OutcomeLog {
    fn append(&self, record: &OutcomeRecord) -> anyhow::Result<()> {
        OutcomeLog::append(self, record).map(|_| ())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<OutcomeRecord> {
    let directive_id: String = row.get(1)?;
    let recorded_at: String = row.get(14)?;
    let disposition_at: Option<String> = row.get(15)?;
    Ok(OutcomeRecord {
        seq: row.get(0)?,
        directive_id: Uuid::parse_str(&directive_id).unwrap_or_default(),
        directive_text: row.get(2)?,
        path: ExecutionPath::from_str_lossy(&row.get::<_, String>(3)?),
        intent: Intent::parse_label(&row.get::<_, String>(4)?).unwrap_or(Intent::Strategy),
        confidence: row.get(5)?,
        verification_status: VerificationStatus::from_str_lossy(&row.get::<_, String>(6)?),
        latency_ms: u64::try_from(row.get::<_, i64>(7)?).unwrap_or(0),
        content_summary: row.get(8)?,
        caveated: row.get(9)?,
        deep_attempts: row.get(10)?,
        instructions_version: u64::try_from(row.get::<_, i64>(11)?).unwrap_or(0),
        disposition: Disposition::from_str_lossy(&row.get::<_, String>(12)?),
        edit_note: row.get(13)?,
        recorded_at: parse_ts(&recorded_at).unwrap_or_else(Utc::now),
        disposition_at: disposition_at.as_deref().and_then(parse_ts),
    })
}
