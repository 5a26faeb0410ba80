//! Explicit time context. Components take a `Clock` at construction instead of
//! reading ambient time, so simulated runs stay reproducible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch (or since simulation start).
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }
}

/// Simulated clock shared between the orchestrator and anything that needs
/// "current time" during a run. Cloning shares the underlying instant.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now: Arc::new(AtomicU64::new(start_ms)) }
    }

    /// Moves time forward; never backwards.
    pub fn advance_to(&self, ts_ms: u64) {
        self.now.fetch_max(ts_ms, Ordering::SeqCst);
    }

    pub fn advance_by(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
