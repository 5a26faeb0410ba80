use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::logging::{self, obj, v_int, v_str, Domain};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),
    #[error("checkpoint corrupt at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Progress marker for resuming a run. Immutable: `update` returns a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Index of the last fully processed input; -1 when nothing is done.
    pub last_processed_idx: i64,
    pub processed_count: u64,
    pub updated_at: String,
}

impl Checkpoint {
    pub fn create_new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            last_processed_idx: -1,
            processed_count: 0,
            updated_at: logging::ts_now(),
        }
    }

    pub fn update(&self, idx: i64) -> Self {
        Self {
            run_id: self.run_id.clone(),
            last_processed_idx: idx,
            processed_count: self.processed_count + 1,
            updated_at: logging::ts_now(),
        }
    }

    /// Number of inputs a resumed run must skip.
    pub fn resume_offset(&self) -> u64 {
        (self.last_processed_idx + 1).max(0) as u64
    }

    /// Write to a sibling temp file, fsync, then rename over `path`.
    /// Readers see either the previous file or the new one, never a mix.
    pub fn save_atomic(&self, path: &Path) -> Result<(), CheckpointError> {
        let io = |source| CheckpointError::Io { path: path.to_path_buf(), source };
        let body = serde_json::to_vec_pretty(self).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let tmp = temp_path(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io)?;
            }
        }
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(io)?;
            f.write_all(&body).map_err(io)?;
            f.flush().map_err(io)?;
            f.sync_all().map_err(io)?;
        }
        fs::rename(&tmp, path).map_err(io)?;
        sync_parent_dir(path);
        logging::debug(
            Domain::Checkpoint,
            "saved",
            obj(&[
                ("run_id", v_str(&self.run_id)),
                ("last_processed_idx", serde_json::json!(self.last_processed_idx)),
                ("processed_count", v_int(self.processed_count)),
            ]),
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(path.to_path_buf()))
            }
            Err(source) => return Err(CheckpointError::Io { path: path.to_path_buf(), source }),
        };
        let cp: Checkpoint = serde_json::from_slice(&raw).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if cp.last_processed_idx < -1 {
            return Err(CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("last_processed_idx {} < -1", cp.last_processed_idx),
            });
        }
        Ok(cp)
    }
}

pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "checkpoint".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
