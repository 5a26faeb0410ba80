//! Deterministic event-driven trading pipeline: signal → risk → execution →
//! position, over an in-process bus, with idempotent execution, seeded retry
//! backoff, atomic checkpoints and a transactional SQLite position ledger.

pub mod adapter;
pub mod bus;
pub mod clock;
pub mod config;
pub mod events;
pub mod fault;
pub mod idempotency;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod reliability;
pub mod runtime;
pub mod workers;
