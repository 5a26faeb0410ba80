//! Pipeline stages. Each worker drains exactly one topic per `step`, which
//! bounds per-call work and lets the orchestrator interleave stages fairly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::bus::EventBus;
use crate::events::{Envelope, OrderIntent};
use crate::idempotency::IdempotencyError;
use crate::ledger::LedgerError;

mod drain;
mod exec;
mod position;
mod risk;

pub use drain::DrainWorker;
pub use exec::{ExecOutcome, ExecWorker, Sleeper};
pub use position::PositionWorker;
pub use risk::RiskWorker;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A decision referenced an intent the orchestrator never cached.
    #[error("intent cache miss: decision {decision_event_id} references unknown intent {intent_event_id}")]
    IntentCacheMiss {
        decision_event_id: String,
        intent_event_id: String,
    },
    #[error("no usable price for {event_id}")]
    MissingPrice { event_id: String },
    #[error("unexpected {got} payload on topic {topic}")]
    UnexpectedPayload { topic: String, got: &'static str },
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub trait Worker: Send {
    fn name(&self) -> &'static str;

    /// The single topic this worker consumes.
    fn topic(&self) -> &str;

    /// Consume up to `max_items` envelopes; returns how many were consumed.
    fn step(&mut self, bus: &mut EventBus, max_items: usize) -> Result<usize, WorkerError>;

    fn stats(&self) -> WorkerStats;
}

/// Counters every stage reports. Stages leave the fields they don't use at 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub consumed: u64,
    pub published: u64,
    pub allowed: u64,
    pub denied: u64,
    pub risk_errors: u64,
    pub executed: u64,
    pub duplicates: u64,
    pub retry_exhausted: u64,
    pub failed: u64,
    pub fills_applied: u64,
    pub ignored: u64,
}

impl WorkerStats {
    pub fn merge(&self, other: &WorkerStats) -> WorkerStats {
        WorkerStats {
            consumed: self.consumed + other.consumed,
            published: self.published + other.published,
            allowed: self.allowed + other.allowed,
            denied: self.denied + other.denied,
            risk_errors: self.risk_errors + other.risk_errors,
            executed: self.executed + other.executed,
            duplicates: self.duplicates + other.duplicates,
            retry_exhausted: self.retry_exhausted + other.retry_exhausted,
            failed: self.failed + other.failed,
            fills_applied: self.fills_applied + other.fills_applied,
            ignored: self.ignored + other.ignored,
        }
    }
}

/// Intents keyed by event id, filled by the orchestrator before an intent is
/// published and read by the exec stage. Cloning shares the map.
#[derive(Debug, Clone, Default)]
pub struct IntentCache {
    inner: Arc<Mutex<HashMap<String, OrderIntent>>>,
}

impl IntentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, OrderIntent>> {
        // the map holds plain values; a panic elsewhere cannot leave it half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, intent: OrderIntent) {
        self.map().insert(intent.event_id.clone(), intent);
    }

    pub fn get(&self, event_id: &str) -> Option<OrderIntent> {
        self.map().get(event_id).cloned()
    }

    pub fn remove(&self, event_id: &str) -> Option<OrderIntent> {
        self.map().remove(event_id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

pub(crate) fn unexpected(env: &Envelope) -> WorkerError {
    WorkerError::UnexpectedPayload {
        topic: env.topic.clone(),
        got: env.payload.kind(),
    }
}
