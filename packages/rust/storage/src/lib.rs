//! libSQL storage for the discovery session log.
//!
//! The [`Storage`] struct wraps a local libSQL database holding sealed
//! [`DiscoverySession`] records. The log is append-only: rows can be inserted
//! and read, and triggers abort any `UPDATE` or `DELETE`.
//!
//! **Access rules:**
//! - generation pipeline: read-write via [`Storage::open`]
//! - reporting (`genpipe sessions ...`): read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use genpipe_shared::{DiscoverySession, GenPipeError, Result, SessionId};
use libsql::{Connection, Database, Row, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Row summary returned by [`Storage::list_sessions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub sealed_at: DateTime<Utc>,
    pub total_attempts: u64,
    pub failed_attempts: u64,
    pub success_rate: f64,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> GenPipeError {
    GenPipeError::Storage(e.to_string())
}

/// Hex SHA-256 of a serialized session record.
pub fn record_digest(record_json: &str) -> String {
    format!("{:x}", Sha256::digest(record_json.as_bytes()))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GenPipeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(GenPipeError::Storage(format!(
                "session log not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        GenPipeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(GenPipeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session log
    // -----------------------------------------------------------------------

    /// Append a sealed session. Appending the same id twice is an error.
    pub async fn append_session(&self, session: &DiscoverySession) -> Result<()> {
        self.check_writable()?;

        let record_json = serde_json::to_string(session)
            .map_err(|e| GenPipeError::Storage(format!("failed to serialize session: {e}")))?;
        let record_hash = record_digest(&record_json);
        let agg = session.aggregates();

        self.conn
            .execute(
                "INSERT INTO discovery_sessions
                    (id, started_at, sealed_at, total_attempts, failed_attempts,
                     success_rate, record_json, record_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    session.id().to_string(),
                    session.started_at().to_rfc3339(),
                    session.sealed_at().to_rfc3339(),
                    agg.total_attempts as i64,
                    agg.failed_attempts as i64,
                    agg.success_rate,
                    record_json,
                    record_hash.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;

        tracing::debug!(
            session = %session.id(),
            attempts = agg.total_attempts,
            hash = %record_hash,
            "session appended"
        );
        Ok(())
    }

    /// Load one session by id, verifying its stored digest.
    pub async fn get_session(&self, id: &SessionId) -> Result<Option<DiscoverySession>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json, record_hash FROM discovery_sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(decode_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent sessions first. `limit` of `None` returns all.
    pub async fn list_sessions(&self, limit: Option<u32>) -> Result<Vec<SessionSummary>> {
        let limit = limit.map(i64::from).unwrap_or(-1);
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, sealed_at, total_attempts, failed_attempts, success_rate
                 FROM discovery_sessions
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(SessionSummary {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: parse_timestamp(&row.get::<String>(1).map_err(storage_err)?)?,
                sealed_at: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
                total_attempts: row.get::<i64>(3).map_err(storage_err)? as u64,
                failed_attempts: row.get::<i64>(4).map_err(storage_err)? as u64,
                success_rate: row.get::<f64>(5).map_err(storage_err)?,
            });
        }
        Ok(results)
    }

    /// Every stored session in recording order, for offline analysis.
    pub async fn load_sessions(&self) -> Result<Vec<DiscoverySession>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json, record_hash FROM discovery_sessions
                 ORDER BY started_at ASC, id ASC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            sessions.push(decode_record(&row)?);
        }
        Ok(sessions)
    }

    pub async fn session_count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM discovery_sessions", params![])
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
            None => Ok(0),
        }
    }
}

fn decode_record(row: &Row) -> Result<DiscoverySession> {
    let record_json = row.get::<String>(0).map_err(storage_err)?;
    let stored_hash = row.get::<String>(1).map_err(storage_err)?;

    if record_digest(&record_json) != stored_hash {
        return Err(GenPipeError::Storage(
            "session record does not match its stored digest".into(),
        ));
    }

    serde_json::from_str(&record_json)
        .map_err(|e| GenPipeError::parse(format!("corrupt session record: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GenPipeError::parse(format!("invalid timestamp '{s}': {e}")))
}
