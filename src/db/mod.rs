pub mod schema;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One stored version of a rule definition.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleVersionRow {
    pub rule_id: String,
    pub version: u32,
    pub definition: String,
    pub deleted: bool,
}

/// Flattened case columns plus the full JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseRow {
    pub id: String,
    pub status: String,
    pub severity: String,
    pub assigned_to: Option<String>,
    pub created_at: String,
    pub sla_due_at: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoteRow {
    pub seq: u32,
    pub author: String,
    pub content: String,
    pub created_at: String,
}

/// A persisted audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: i64,
    pub at: String,
    pub kind: String,
    pub subject_id: String,
    pub actor: Option<String>,
    pub detail: Option<String>,
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_rule_version(
        &self,
        rule_id: &str,
        version: u32,
        definition: &str,
        deleted: bool,
    ) -> Result<(), rusqlite::Error> {
        self.lock().insert_rule_version(rule_id, version, definition, deleted)
    }

    /// Every stored rule version in write order.
    pub fn all_rule_versions(&self) -> Result<Vec<RuleVersionRow>, rusqlite::Error> {
        self.lock().all_rule_versions()
    }

    /// Upsert a case and append any notes not yet stored, in one transaction.
    pub fn save_case(&self, case: &CaseRow, notes: &[NoteRow]) -> Result<(), rusqlite::Error> {
        self.lock().save_case(case, notes)
    }

    pub fn load_case_bodies(&self) -> Result<Vec<String>, rusqlite::Error> {
        self.lock().load_case_bodies()
    }

    pub fn case_notes(&self, case_id: &str) -> Result<Vec<NoteRow>, rusqlite::Error> {
        self.lock().case_notes(case_id)
    }

    pub fn append_audit(
        &self,
        at: &str,
        kind: &str,
        subject_id: &str,
        actor: Option<&str>,
        detail: Option<&str>,
    ) -> Result<i64, rusqlite::Error> {
        self.lock().append_audit(at, kind, subject_id, actor, detail)
    }

    pub fn audit_for_subject(&self, subject_id: &str) -> Result<Vec<AuditRecord>, rusqlite::Error> {
        self.lock().audit_for_subject(subject_id)
    }

    pub fn audit_count(&self) -> Result<usize, rusqlite::Error> {
        self.lock().audit_count()
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn insert_rule_version(
        &self,
        rule_id: &str,
        version: u32,
        definition: &str,
        deleted: bool,
    ) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO rule_versions (rule_id, version, definition, deleted, recorded_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))",
            rusqlite::params![rule_id, version, definition, deleted as i32],
        )?;
        Ok(())
    }

    pub fn all_rule_versions(&self) -> Result<Vec<RuleVersionRow>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, version, definition, deleted FROM rule_versions ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let deleted: i32 = row.get(3)?;
            Ok(RuleVersionRow {
                rule_id: row.get(0)?,
                version: row.get(1)?,
                definition: row.get(2)?,
                deleted: deleted != 0,
            })
        })?;
        rows.collect()
    }

    pub fn save_case(&self, case: &CaseRow, notes: &[NoteRow]) -> Result<(), rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO cases (id, status, severity, assigned_to, created_at, sla_due_at, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                severity = excluded.severity,
                assigned_to = excluded.assigned_to,
                sla_due_at = excluded.sla_due_at,
                body = excluded.body,
                updated_at = excluded.updated_at",
            rusqlite::params![
                case.id,
                case.status,
                case.severity,
                case.assigned_to,
                case.created_at,
                case.sla_due_at,
                case.body
            ],
        )?;
        {
            // Notes are append-only: existing rows are never rewritten.
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO case_notes (case_id, seq, author, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for n in notes {
                stmt.execute(rusqlite::params![case.id, n.seq, n.author, n.content, n.created_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_case_bodies(&self) -> Result<Vec<String>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM cases ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    pub fn case_notes(&self, case_id: &str) -> Result<Vec<NoteRow>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, author, content, created_at FROM case_notes WHERE case_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![case_id], |row| {
            Ok(NoteRow {
                seq: row.get(0)?,
                author: row.get(1)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        rows.collect()
    }

    pub fn append_audit(
        &self,
        at: &str,
        kind: &str,
        subject_id: &str,
        actor: Option<&str>,
        detail: Option<&str>,
    ) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO audit_log (at, kind, subject_id, actor, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![at, kind, subject_id, actor, detail],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn audit_for_subject(&self, subject_id: &str) -> Result<Vec<AuditRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, at, kind, subject_id, actor, detail FROM audit_log WHERE subject_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![subject_id], |row| {
            Ok(AuditRecord {
                seq: row.get(0)?,
                at: row.get(1)?,
                kind: row.get(2)?,
                subject_id: row.get(3)?,
                actor: row.get(4)?,
                detail: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    pub fn audit_count(&self) -> Result<usize, rusqlite::Error> {
        self.conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| {
            row.get::<_, i64>(0).map(|c| c as usize)
        })
    }
}
