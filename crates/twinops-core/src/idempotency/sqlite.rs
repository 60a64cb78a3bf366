//! `SQLite`-backed idempotency store for multi-worker deployments.
//!
//! Uses WAL mode so concurrent workers can read while one writes; rows
//! are upserted per key and expired rows are swept lazily on access.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection};
use serde_json::Value;

use super::{IdempotencyError, IdempotencyStore};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS idempotency (
    fingerprint TEXT PRIMARY KEY,
    expires_at  INTEGER NOT NULL,
    result      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency (expires_at);
";

/// Idempotency store shared between worker processes through a
/// `SQLite` file.
pub struct SqliteIdempotencyStore {
    conn: Mutex<Connection>,
    ttl: Duration,
}

impl SqliteIdempotencyStore {
    /// Opens or creates the store at `path` with WAL mode enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self, IdempotencyError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| IdempotencyError::Storage(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(storage_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(storage_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory(ttl: Duration) -> Result<Self, IdempotencyError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
        })
    }

    fn sweep(conn: &Connection) -> Result<(), IdempotencyError> {
        conn.execute(
            "DELETE FROM idempotency WHERE expires_at < ?1",
            params![now_millis()],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: rusqlite::Error) -> IdempotencyError {
    IdempotencyError::Storage(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait::async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<Value>, IdempotencyError> {
        let conn = self.conn.lock().unwrap();
        Self::sweep(&conn)?;

        let row: Option<String> = conn
            .query_row(
                "SELECT result FROM idempotency WHERE fingerprint = ?1 AND expires_at >= ?2",
                params![fingerprint, now_millis()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(storage_err(other)),
            })?;

        match row {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| IdempotencyError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn put(&self, fingerprint: &str, result: Value) -> Result<(), IdempotencyError> {
        let conn = self.conn.lock().unwrap();
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let expires_at = now_millis() + self.ttl.as_millis() as i64;

        conn.execute(
            "INSERT INTO idempotency (fingerprint, expires_at, result)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 expires_at = excluded.expires_at,
                 result = excluded.result",
            params![fingerprint, expires_at, result.to_string()],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}
