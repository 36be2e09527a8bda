//! SQL migration definitions for the genpipe session log.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: append-only discovery_sessions",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per sealed discovery session
CREATE TABLE IF NOT EXISTS discovery_sessions (
    id              TEXT PRIMARY KEY,
    started_at      TEXT NOT NULL,
    sealed_at       TEXT NOT NULL,
    total_attempts  INTEGER NOT NULL,
    failed_attempts INTEGER NOT NULL,
    success_rate    REAL NOT NULL,
    record_json     TEXT NOT NULL,
    record_hash     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_started ON discovery_sessions(started_at);

-- Sealed sessions are immutable
CREATE TRIGGER IF NOT EXISTS discovery_sessions_no_update
BEFORE UPDATE ON discovery_sessions BEGIN
    SELECT RAISE(ABORT, 'discovery sessions are append-only');
END;

CREATE TRIGGER IF NOT EXISTS discovery_sessions_no_delete
BEFORE DELETE ON discovery_sessions BEGIN
    SELECT RAISE(ABORT, 'discovery sessions are append-only');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
