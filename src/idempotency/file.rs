use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{validate_key, IdempotencyError, IdempotencyStore};
use crate::clock::Clock;
use crate::logging::{self, obj, v_int, v_str, Domain};

/// Append-only log of seen keys, one `<first_seen_ms>\t<key>` line each.
///
/// The log is replayed on open, so a restarted process sees every key written
/// before the crash. A torn trailing line (crash mid-append) is truncated away;
/// any other malformed line is reported as corruption.
pub struct FileIdempotencyStore {
    file: File,
    path: PathBuf,
    seen: HashSet<String>,
    clock: Arc<dyn Clock>,
}

impl FileIdempotencyStore {
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, IdempotencyError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let seen = Self::replay(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        logging::debug(
            Domain::Idempotency,
            "log_replayed",
            obj(&[
                ("path", v_str(&path.to_string_lossy())),
                ("keys", v_int(seen.len() as u64)),
            ]),
        );
        Ok(Self { file, path, seen, clock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn replay(path: &Path) -> Result<HashSet<String>, IdempotencyError> {
        let mut seen = HashSet::new();
        if !path.exists() {
            return Ok(seen);
        }
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        let raw = String::from_utf8(bytes).map_err(|e| {
            let bytes = e.as_bytes();
            let bad = e.utf8_error().valid_up_to();
            let start = bytes[..bad].iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1);
            let end = bytes[bad..].iter().position(|b| *b == b'\n').map_or(bytes.len(), |p| bad + p);
            IdempotencyError::Corrupt {
                line: bytes[..bad].iter().filter(|b| **b == b'\n').count() + 1,
                content: String::from_utf8_lossy(&bytes[start..end]).into_owned(),
            }
        })?;

        let complete = match raw.rfind('\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        if complete < raw.len() {
            logging::warn(
                Domain::Idempotency,
                "torn_tail_truncated",
                obj(&[("bytes", v_int((raw.len() - complete) as u64))]),
            );
            OpenOptions::new().write(true).open(path)?.set_len(complete as u64)?;
        }

        for (i, line) in raw[..complete].lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            match line.split_once('\t') {
                Some((ts, key)) if ts.parse::<u64>().is_ok() && !key.is_empty() => {
                    seen.insert(key.to_string());
                }
                _ => {
                    return Err(IdempotencyError::Corrupt {
                        line: i + 1,
                        content: line.to_string(),
                    })
                }
            }
        }
        Ok(seen)
    }
}

impl IdempotencyStore for FileIdempotencyStore {
    fn mark_once(&mut self, key: &str) -> Result<bool, IdempotencyError> {
        validate_key(key)?;
        if self.seen.contains(key) {
            return Ok(false);
        }
        let line = format!("{}\t{}\n", self.clock.now_ms(), key);
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.seen.insert(key.to_string());
        Ok(true)
    }
}
