//! Audit log — records how every pairing session ended.

use chrono::{DateTime, Utc};
use prime_core::error::PrimeError;
use prime_core::shellexpand;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS pairing_audit (\
    id TEXT PRIMARY KEY, \
    session_id TEXT NOT NULL, \
    phone TEXT NOT NULL, \
    outcome TEXT NOT NULL, \
    detail TEXT, \
    duration_ms INTEGER NOT NULL, \
    created_at TEXT NOT NULL DEFAULT (datetime('now')))";

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Completed,
    Failed,
    Closed,
    Evicted,
    Cancelled,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Closed => "closed",
            Self::Evicted => "evicted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// An entry to write to the audit log.
pub struct AuditEntry {
    pub session_id: String,
    /// Already masked by the caller.
    pub phone: String,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub duration_ms: i64,
}

/// A stored audit row.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub session_id: String,
    pub phone: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub duration_ms: i64,
    pub created_at: String,
}

/// Audit logger backed by SQLite.
#[derive(Clone)]
pub struct AuditLogger {
    pool: SqlitePool,
}

impl AuditLogger {
    /// Open (creating if needed) the database at `db_path` and ensure the schema.
    pub async fn open(db_path: &str) -> Result<Self, PrimeError> {
        let path = shellexpand(db_path);
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| PrimeError::Memory(format!("failed to open {path}: {e}")))?;

        Self::with_pool(pool).await
    }

    /// A private in-memory database, for tests and dry runs.
    pub async fn in_memory() -> Result<Self, PrimeError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| PrimeError::Memory(format!("bad in-memory url: {e}")))?;
        // One connection: every pooled connection would get its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| PrimeError::Memory(format!("failed to open in-memory db: {e}")))?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, PrimeError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| PrimeError::Memory(format!("audit schema failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Write an entry to the audit log.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), PrimeError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO pairing_audit \
             (id, session_id, phone, outcome, detail, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&entry.session_id)
        .bind(&entry.phone)
        .bind(entry.outcome.as_str())
        .bind(&entry.detail)
        .bind(entry.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| PrimeError::Memory(format!("audit log write failed: {e}")))?;

        debug!(
            "audit: {} {} [{}]",
            entry.session_id,
            entry.phone,
            entry.outcome.as_str()
        );

        Ok(())
    }

    /// Most recent rows first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditRecord>, PrimeError> {
        let rows: Vec<(String, String, String, Option<String>, i64, String)> = sqlx::query_as(
            "SELECT session_id, phone, outcome, detail, duration_ms, created_at \
             FROM pairing_audit ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PrimeError::Memory(format!("audit read failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(
                |(session_id, phone, outcome, detail, duration_ms, created_at)| AuditRecord {
                    session_id,
                    phone,
                    outcome,
                    detail,
                    duration_ms,
                    created_at,
                },
            )
            .collect())
    }

    /// Row count per outcome since `since`.
    pub async fn outcome_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>, PrimeError> {
        let since = since.format("%Y-%m-%d %H:%M:%S").to_string();
        sqlx::query_as(
            "SELECT outcome, COUNT(*) FROM pairing_audit \
             WHERE created_at >= ? GROUP BY outcome ORDER BY outcome",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PrimeError::Memory(format!("audit count failed: {e}")))
    }
}
