use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{validate_key, IdempotencyError, IdempotencyStore};
use crate::clock::Clock;

const DEFAULT_SWEEP_THRESHOLD: usize = 10_000;

/// Ephemeral store: key → first-seen time, forgotten after `ttl`.
/// Nothing survives a restart.
pub struct TtlIdempotencyStore {
    seen: HashMap<String, u64>,
    ttl_ms: u64,
    sweep_threshold: usize,
    clock: Arc<dyn Clock>,
}

impl TtlIdempotencyStore {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: HashMap::new(),
            ttl_ms: ttl.as_millis() as u64,
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
            clock,
        }
    }

    pub fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expired(&self, first_seen: u64, now: u64) -> bool {
        now.saturating_sub(first_seen) >= self.ttl_ms
    }

    fn sweep(&mut self, now: u64) {
        let ttl = self.ttl_ms;
        self.seen.retain(|_, first| now.saturating_sub(*first) < ttl);
    }
}

impl IdempotencyStore for TtlIdempotencyStore {
    fn mark_once(&mut self, key: &str) -> Result<bool, IdempotencyError> {
        validate_key(key)?;
        let now = self.clock.now_ms();
        if let Some(&first) = self.seen.get(key) {
            if !self.expired(first, now) {
                return Ok(false);
            }
        }
        self.seen.insert(key.to_string(), now);
        if self.seen.len() > self.sweep_threshold {
            self.sweep(now);
        }
        Ok(true)
    }
}
