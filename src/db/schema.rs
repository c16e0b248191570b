use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rule_versions (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id     TEXT NOT NULL,
            version     INTEGER NOT NULL,
            definition  TEXT NOT NULL, -- JSON
            deleted     INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cases (
            id          TEXT PRIMARY KEY,
            status      TEXT NOT NULL,
            severity    TEXT NOT NULL,
            assigned_to TEXT,
            created_at  TEXT NOT NULL,
            sla_due_at  TEXT NOT NULL,
            body        TEXT NOT NULL, -- JSON
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS case_notes (
            case_id     TEXT NOT NULL,
            seq         INTEGER NOT NULL,
            author      TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (case_id, seq)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            at          TEXT NOT NULL,
            kind        TEXT NOT NULL,
            subject_id  TEXT NOT NULL,
            actor       TEXT,
            detail      TEXT -- JSON
        );

        CREATE INDEX IF NOT EXISTS idx_rule_versions_rule ON rule_versions(rule_id, seq);
        CREATE INDEX IF NOT EXISTS idx_cases_status ON cases(status);
        CREATE INDEX IF NOT EXISTS idx_cases_created ON cases(created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject_id);
        ",
    )?;
    Ok(())
}
