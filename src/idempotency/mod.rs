//! "Have I done this operation before?"
//!
//! One contract, three backends. `mark_once(key)` returns `true` exactly once
//! per key and `false` afterwards; callers proceed only on `true`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

mod file;
mod memory;
mod sqlite;

pub use file::FileIdempotencyStore;
pub use memory::TtlIdempotencyStore;
pub use sqlite::SqliteIdempotencyStore;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("invalid idempotency key {0:?}")]
    InvalidKey(String),
    #[error("idempotency log corrupt at line {line}: {content:?}")]
    Corrupt { line: usize, content: String },
    #[error("idempotency log io: {0}")]
    Io(#[from] std::io::Error),
    #[error("idempotency db: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub trait IdempotencyStore: Send {
    /// `true` the first time `key` is seen, `false` on every later call.
    fn mark_once(&mut self, key: &str) -> Result<bool, IdempotencyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyBackend {
    Memory,
    File,
    Sqlite,
}

impl IdempotencyBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "ttl" => Some(Self::Memory),
            "file" | "log" => Some(Self::File),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Sqlite => "sqlite",
        }
    }

    /// Default file name for this backend inside a data directory.
    pub fn file_name(&self) -> Option<&'static str> {
        match self {
            Self::Memory => None,
            Self::File => Some("idempotency.log"),
            Self::Sqlite => Some("idempotency.sqlite"),
        }
    }
}

/// Open a store for `backend`. `dir` is ignored by the memory backend.
pub fn open_store(
    backend: IdempotencyBackend,
    dir: &Path,
    ttl: Duration,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn IdempotencyStore>, IdempotencyError> {
    let path = dir.join(backend.file_name().unwrap_or_default());
    Ok(match backend {
        IdempotencyBackend::Memory => Box::new(TtlIdempotencyStore::new(ttl, clock)),
        IdempotencyBackend::File => Box::new(FileIdempotencyStore::open(path, clock)?),
        IdempotencyBackend::Sqlite => Box::new(SqliteIdempotencyStore::open(path, clock)?),
    })
}

pub(crate) fn validate_key(key: &str) -> Result<(), IdempotencyError> {
    if key.is_empty() || key.contains('\n') || key.contains('\r') || key.contains('\t') {
        return Err(IdempotencyError::InvalidKey(key.to_string()));
    }
    Ok(())
}
