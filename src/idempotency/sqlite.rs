use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode};

use super::{validate_key, IdempotencyError, IdempotencyStore};
use crate::clock::Clock;

/// SQLite-backed store. Uniqueness is enforced by the primary key, so any
/// number of connections (threads or processes) may race on the same file and
/// exactly one insert wins.
pub struct SqliteIdempotencyStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl SqliteIdempotencyStore {
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, IdempotencyError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns a row, so it cannot go through execute()
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        Self::init(conn, clock)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, IdempotencyError> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, IdempotencyError> {
        conn.execute_batch(
            "PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY NOT NULL,
                first_seen_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn, clock })
    }

    pub fn first_seen_at(&self, key: &str) -> Result<Option<u64>, IdempotencyError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT first_seen_at FROM idempotency_keys WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get::<_, i64>(0)? as u64)),
            None => Ok(None),
        }
    }
}

impl IdempotencyStore for SqliteIdempotencyStore {
    fn mark_once(&mut self, key: &str) -> Result<bool, IdempotencyError> {
        validate_key(key)?;
        let res = self.conn.execute(
            "INSERT INTO idempotency_keys (key, first_seen_at) VALUES (?1, ?2)",
            params![key, self.clock.now_ms() as i64],
        );
        match res {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
