use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::outcome::store::{parse_ts, ts};

use super::document::{OperatingInstructions, SEED_BODY, SEED_RATIONALE};

/// Listing entry for one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionsMeta {
    pub version: u64,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub confidence_threshold: Option<f64>,
}

impl InstructionsMeta {
    fn of(doc: &OperatingInstructions, active: bool) -> Self {
        Self {
            version: doc.version,
            rationale: doc.rationale.clone(),
            created_at: doc.created_at,
            active,
            confidence_threshold: doc.confidence_threshold(),
        }
    }
}

// ── Persistence seam ─────────────────────────────────────────────

/// Durable storage for instruction versions.
pub trait InstructionsBackend: Send + Sync {
    fn active_version(&self) -> Result<Option<u64>>;
    fn latest_version(&self) -> Result<u64>;
    fn get(&self, version: u64) -> Result<Option<OperatingInstructions>>;
    /// All versions, oldest first.
    fn list(&self) -> Result<Vec<OperatingInstructions>>;
    /// Insert a new version and make it active in one transaction.
    fn insert_and_activate(&self, doc: &OperatingInstructions) -> Result<()>;
    fn set_active(&self, version: u64) -> Result<()>;
}

pub struct SqliteInstructionsBackend {
    conn: Mutex<Connection>,
}

impl SqliteInstructionsBackend {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;
        let db_path = data_dir.join("instructions.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open instructions DB: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = FULL;",
        )?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instruction_versions (
                version    INTEGER PRIMARY KEY,
                content    TEXT NOT NULL,
                rationale  TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS instruction_state (
                id             INTEGER PRIMARY KEY CHECK (id = 1),
                active_version INTEGER NOT NULL REFERENCES instruction_versions(version)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn row_to_doc(row: &rusqlite::Row<'_>) -> rusqlite::Result<OperatingInstructions> {
    let created_at: String = row.get(3)?;
    Ok(OperatingInstructions {
        version: u64::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
        content: row.get(1)?,
        rationale: row.get(2)?,
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

fn sql_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

impl InstructionsBackend for SqliteInstructionsBackend {
    fn active_version(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let v: Option<i64> = conn
            .query_row(
                "SELECT active_version FROM instruction_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v.and_then(|v| u64::try_from(v).ok()))
    }

    fn latest_version(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let v: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM instruction_versions",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(v).unwrap_or(0))
    }

    fn get(&self, version: u64) -> Result<Option<OperatingInstructions>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT version, content, rationale, created_at
                 FROM instruction_versions WHERE version = ?1",
                params![sql_version(version)],
                row_to_doc,
            )
            .optional()?)
    }

    fn list(&self) -> Result<Vec<OperatingInstructions>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT version, content, rationale, created_at
             FROM instruction_versions ORDER BY version ASC",
        )?;
        let rows = stmt.query_map([], row_to_doc)?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    fn insert_and_activate(&self, doc: &OperatingInstructions) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO instruction_versions (version, content, rationale, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![sql_version(doc.version), doc.content, doc.rationale, ts(doc.created_at)],
        )?;
        tx.execute(
            "INSERT INTO instruction_state (id, active_version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET active_version = excluded.active_version",
            params![sql_version(doc.version)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_active(&self, version: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instruction_state (id, active_version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET active_version = excluded.active_version",
            params![sql_version(version)],
        )?;
        Ok(())
    }
}

// ── Store ────────────────────────────────────────────────────────

/// Versioned operating instructions with a hot, lock-cheap active snapshot.
///
/// Readers clone an `Arc` of the active version and never wait on a writer's
/// I/O. Writers serialize on `writer`, persist first, then swap the snapshot,
/// so a reader sees either the previous or the new version in full.
pub struct InstructionsStore {
    backend: Arc<dyn InstructionsBackend>,
    active: RwLock<Arc<OperatingInstructions>>,
    writer: Mutex<()>,
}

impl InstructionsStore {
    /// Open the store, seeding version 1 when the backend is empty.
    pub fn open(backend: Arc<dyn InstructionsBackend>) -> Result<Self> {
        let active = match backend.active_version()? {
            Some(v) => backend
                .get(v)?
                .with_context(|| format!("Active instructions version {v} is missing"))?,
            None => {
                let seed = OperatingInstructions {
                    version: backend.latest_version()? + 1,
                    content: SEED_BODY.to_string(),
                    rationale: SEED_RATIONALE.to_string(),
                    created_at: Utc::now(),
                };
                backend
                    .insert_and_activate(&seed)
                    .context("Failed to seed operating instructions")?;
                tracing::info!(version = seed.version, "Seeded operating instructions");
                seed
            }
        };
        Ok(Self {
            backend,
            active: RwLock::new(Arc::new(active)),
            writer: Mutex::new(()),
        })
    }

    /// Snapshot of the active version.
    pub fn active(&self) -> Arc<OperatingInstructions> {
        Arc::clone(&self.active.read())
    }

    pub fn active_meta(&self) -> InstructionsMeta {
        InstructionsMeta::of(&self.active(), true)
    }

    pub fn get(&self, version: u64) -> Result<Option<OperatingInstructions>> {
        self.backend.get(version)
    }

    pub fn list(&self) -> Result<Vec<InstructionsMeta>> {
        let active = self.active().version;
        Ok(self
            .backend
            .list()?
            .iter()
            .map(|doc| InstructionsMeta::of(doc, doc.version == active))
            .collect())
    }

    /// Persist a new version and make it active.
    ///
    /// On failure the previous version stays active and the error is an
    /// `InstructionsCommitFailure`.
    pub fn commit(&self, content: String, rationale: String) -> EngineResult<OperatingInstructions> {
        self.commit_with(rationale, |_, _| content)
    }

    /// Like [`commit`](Self::commit), with content built from the active
    /// version and the version number being assigned, both read under the
    /// writer lock.
    pub fn commit_with(
        &self,
        rationale: String,
        build: impl FnOnce(&OperatingInstructions, u64) -> String,
    ) -> EngineResult<OperatingInstructions> {
        let _guard = self.writer.lock();
        let latest = self
            .backend
            .latest_version()
            .map_err(|e| EngineError::InstructionsCommitFailure(format!("{e:#}")))?;
        let next = latest + 1;
        let content = build(&self.active(), next);
        let doc = OperatingInstructions {
            version: next,
            content,
            rationale,
            created_at: Utc::now(),
        };
        self.backend
            .insert_and_activate(&doc)
            .map_err(|e| EngineError::InstructionsCommitFailure(format!("{e:#}")))?;

        *self.active.write() = Arc::new(doc.clone());
        tracing::info!(version = doc.version, rationale = %doc.rationale, "Operating instructions committed");
        Ok(doc)
    }

    /// Re-activate a retained version (rollback or roll-forward).
    pub fn activate(&self, version: u64) -> EngineResult<OperatingInstructions> {
        let _guard = self.writer.lock();
        let doc = self
            .backend
            .get(version)?
            .ok_or(EngineError::UnknownVersion(version))?;
        self.backend.set_active(version)?;
        *self.active.write() = Arc::new(doc.clone());
        tracing::info!(version, "Operating instructions activated");
        Ok(doc)
    }

    /// Pick up a version activated by another process. Returns the new
    /// active version when it changed.
    pub fn reload(&self) -> Result<Option<u64>> {
        let Some(version) = self.backend.active_version()? else {
            return Ok(None);
        };
        if version == self.active().version {
            return Ok(None);
        }
        let _guard = self.writer.lock();
        let doc = self
            .backend
            .get(version)?
            .with_context(|| format!("Active instructions version {version} is missing"))?;
        *self.active.write() = Arc::new(doc);
        tracing::info!(version, "Operating instructions reloaded");
        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FailingInstructionsBackend;

    fn store() -> InstructionsStore {
        InstructionsStore::open(Arc::new(SqliteInstructionsBackend::in_memory().unwrap())).unwrap()
    }

    #[test]
    fn empty_backend_is_seeded_with_version_one() {
        let store = store();
        let active = store.active();
        assert_eq!(active.version, 1);
        assert_eq!(active.rationale, SEED_RATIONALE);
        assert!(store.active_meta().active);
    }

    #[test]
    fn commits_strictly_increase_and_keep_history() {
        let store = store();
        let v2 = store.commit("second".into(), "because".into()).unwrap();
        let v3 = store.commit("third".into(), "again".into()).unwrap();
        assert_eq!((v2.version, v3.version), (2, 3));
        assert_eq!(store.active().version, 3);

        let versions: Vec<u64> = store.list().unwrap().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(store.get(2).unwrap().unwrap().content, "second");
    }

    #[test]
    fn rollback_then_commit_uses_next_free_version() {
        let store = store();
        store.commit("second".into(), "r".into()).unwrap();
        store.activate(1).unwrap();
        assert_eq!(store.active().version, 1);
        let list = store.list().unwrap();
        assert!(list.iter().find(|m| m.version == 1).unwrap().active);
        assert!(!list.iter().find(|m| m.version == 2).unwrap().active);

        let next = store.commit("third".into(), "r".into()).unwrap();
        assert_eq!(next.version, 3);
    }

    #[test]
    fn activate_unknown_version_fails() {
        let store = store();
        assert!(matches!(store.activate(42), Err(EngineError::UnknownVersion(42))));
        assert_eq!(store.active().version, 1);
    }

    #[test]
    fn commit_failure_keeps_previous_version_active() {
        let backend = Arc::new(FailingInstructionsBackend::new());
        let store = InstructionsStore::open(backend.clone()).unwrap();
        backend.set_failing(true);

        let err = store.commit("broken".into(), "r".into()).unwrap_err();
        assert!(matches!(err, EngineError::InstructionsCommitFailure(_)));
        assert_eq!(store.active().version, 1);

        backend.set_failing(false);
        assert_eq!(store.commit("ok".into(), "r".into()).unwrap().version, 2);
    }

    #[test]
    fn reload_picks_up_external_activation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let server = InstructionsStore::open(Arc::new(SqliteInstructionsBackend::open(tmp.path()).unwrap()))
            .unwrap();
        let cli = InstructionsStore::open(Arc::new(SqliteInstructionsBackend::open(tmp.path()).unwrap()))
            .unwrap();

        cli.commit("from cli".into(), "manual".into()).unwrap();
        assert_eq!(server.active().version, 1);
        assert_eq!(server.reload().unwrap(), Some(2));
        assert_eq!(server.active().content, "from cli");
        assert_eq!(server.reload().unwrap(), None);
    }

    #[test]
    fn readers_hold_snapshots_across_commits() {
        let store = store();
        let before = store.active();
        store.commit("next".into(), "r".into()).unwrap();
        assert_eq!(before.version, 1);
        assert_eq!(store.active().version, 2);
    }
}
