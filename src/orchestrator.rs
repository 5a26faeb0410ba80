//! Step loop that feeds market events through the worker pipeline.
//!
//! One step = one `peek_next_ts` / `poll` pair. Every polled event is one
//! input index: it goes to the signal source, its intents are published, and
//! the bus is drained to empty before the checkpoint moves past it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::adapter::{IntentDraft, MarketDataAdapter, SignalSource};
use crate::bus::EventBus;
use crate::clock::SimClock;
use crate::events::{intent_id, topics, trace_id, MarketEvent, OrderIntent, Payload};
use crate::logging::{self, obj, v_int, v_str, Domain};
use crate::reliability::{Checkpoint, CheckpointError};
use crate::workers::{IntentCache, Worker, WorkerError, WorkerStats};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("lookahead: event {event_id} at ts {event_ts} returned for step ts {step_ts}")]
    Lookahead { event_id: String, event_ts: u64, step_ts: u64 },
    #[error("deadlock: no worker made progress at drain iteration {iteration} with {pending} pending")]
    Deadlock { iteration: usize, pending: usize },
    #[error("drain did not settle within {cap} iterations ({pending} still pending)")]
    DrainCapExceeded { cap: usize, pending: usize },
    #[error("no consumer registered for topic {0}")]
    MissingConsumer(String),
    #[error("more than one consumer registered for topic {0}")]
    DuplicateConsumer(String),
    #[error("checkpoint expects {expected} processed inputs but the stream ended after {available}")]
    ResumeBeyondEnd { expected: u64, available: u64 },
    #[error("worker {worker} failed: {source}")]
    Worker {
        worker: &'static str,
        #[source]
        source: WorkerError,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound on worker rounds per input before the drain is abandoned.
    pub max_drain_iterations: usize,
    /// `max_items` handed to each worker per round.
    pub worker_batch: usize,
    /// Market events requested per step.
    pub poll_batch: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_drain_iterations: 10_000,
            worker_batch: 64,
            poll_batch: 1,
        }
    }
}

/// Cooperative stop flag, checked between steps. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub steps: u64,
    pub events: u64,
    pub skipped: u64,
    pub intents: u64,
    pub decisions_allowed: u64,
    pub decisions_denied: u64,
    pub reports: u64,
    pub duplicates: u64,
    pub retry_exhausted: u64,
    pub failed: u64,
    pub fills_applied: u64,
    pub drain_iterations: u64,
    pub stopped: bool,
    pub last_processed_idx: i64,
    pub workers: BTreeMap<String, WorkerStats>,
}

pub struct OrchestratorBuilder {
    market: Box<dyn MarketDataAdapter>,
    signal: Box<dyn SignalSource>,
    workers: Vec<Box<dyn Worker>>,
    config: OrchestratorConfig,
    intents: IntentCache,
    clock: SimClock,
    stop: StopSignal,
    run_id: String,
    checkpoint: Option<Checkpoint>,
    checkpoint_path: Option<PathBuf>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker(mut self, worker: Box<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Cache shared with the exec stage.
    pub fn intent_cache(mut self, intents: IntentCache) -> Self {
        self.intents = intents;
        self
    }

    pub fn clock(mut self, clock: SimClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }

    /// Persist progress to `path` after every input.
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Continue from `checkpoint`: its processed inputs are replayed to the
    /// signal source but not re-published.
    pub fn resume_from(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn build(mut self) -> Result<Orchestrator, PipelineError> {
        for topic in topics::PIPELINE {
            match self.workers.iter().filter(|w| w.topic() == topic).count() {
                0 => return Err(PipelineError::MissingConsumer(topic.to_string())),
                1 => {}
                _ => return Err(PipelineError::DuplicateConsumer(topic.to_string())),
            }
        }
        // stage order: intents, decisions, reports, then anything extra
        self.workers.sort_by_key(|w| {
            topics::PIPELINE
                .iter()
                .position(|t| *t == w.topic())
                .unwrap_or(topics::PIPELINE.len())
        });

        let checkpoint = self
            .checkpoint
            .unwrap_or_else(|| Checkpoint::create_new(&self.run_id));
        let skip = checkpoint.resume_offset();
        logging::info(
            Domain::Orchestrator,
            "built",
            obj(&[
                ("run_id", v_str(&checkpoint.run_id)),
                ("workers", serde_json::json!(self.workers.iter().map(|w| w.name()).collect::<Vec<_>>())),
                ("resume_offset", v_int(skip)),
            ]),
        );

        Ok(Orchestrator {
            report: RunReport {
                run_id: checkpoint.run_id.clone(),
                last_processed_idx: checkpoint.last_processed_idx,
                ..RunReport::default()
            },
            bus: EventBus::new(),
            market: self.market,
            signal: self.signal,
            workers: self.workers,
            config: self.config,
            intents: self.intents,
            clock: self.clock,
            stop: self.stop,
            checkpoint,
            checkpoint_path: self.checkpoint_path,
            skip,
            next_idx: 0,
        })
    }
}

pub struct Orchestrator {
    bus: EventBus,
    market: Box<dyn MarketDataAdapter>,
    signal: Box<dyn SignalSource>,
    workers: Vec<Box<dyn Worker>>,
    config: OrchestratorConfig,
    intents: IntentCache,
    clock: SimClock,
    stop: StopSignal,
    checkpoint: Checkpoint,
    checkpoint_path: Option<PathBuf>,
    /// Inputs to replay without publishing before live processing starts.
    skip: u64,
    next_idx: u64,
    report: RunReport,
}

impl Orchestrator {
    pub fn builder(market: Box<dyn MarketDataAdapter>, signal: Box<dyn SignalSource>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            market,
            signal,
            workers: Vec::new(),
            config: OrchestratorConfig::default(),
            intents: IntentCache::new(),
            clock: SimClock::new(0),
            stop: StopSignal::new(),
            run_id: "run".to_string(),
            checkpoint: None,
            checkpoint_path: None,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Process up to `max_steps` steps (all remaining when `None`). Stops early
    /// when the stream is exhausted or the stop signal is raised; queues are
    /// always drained before returning.
    pub fn run(&mut self, max_steps: Option<usize>) -> Result<RunReport, PipelineError> {
        self.replay_skipped()?;

        let mut steps = 0usize;
        'steps: loop {
            if self.stop.is_stopped() {
                self.mark_stopped(steps);
                break;
            }
            if max_steps.is_some_and(|max| steps >= max) {
                break;
            }
            let Some(step_ts) = self.market.peek_next_ts() else {
                break;
            };
            self.clock.advance_to(step_ts);
            let events = self.market.poll(self.config.poll_batch.max(1), step_ts);
            if events.is_empty() {
                break;
            }
            for event in &events {
                check_lookahead(event, step_ts)?;
            }
            for event in &events {
                // unprocessed events of this batch are re-polled on resume
                if self.stop.is_stopped() {
                    self.mark_stopped(steps);
                    break 'steps;
                }
                self.process_input(event)?;
            }
            steps += 1;
            self.report.steps += 1;
        }

        Ok(self.snapshot())
    }

    fn mark_stopped(&mut self, steps: usize) {
        self.report.stopped = true;
        logging::info(
            Domain::Orchestrator,
            "stop_requested",
            obj(&[("steps", v_int(steps as u64)), ("next_idx", v_int(self.next_idx))]),
        );
    }

    /// Feed already-processed inputs to the signal source so stateful signals
    /// reach the same state an uninterrupted run would have.
    fn replay_skipped(&mut self) -> Result<(), PipelineError> {
        if self.next_idx >= self.skip {
            return Ok(());
        }
        while self.next_idx < self.skip {
            let Some(step_ts) = self.market.peek_next_ts() else {
                return Err(PipelineError::ResumeBeyondEnd { expected: self.skip, available: self.next_idx });
            };
            self.clock.advance_to(step_ts);
            let want = (self.skip - self.next_idx).min(self.config.poll_batch.max(1) as u64) as usize;
            let events = self.market.poll(want, step_ts);
            if events.is_empty() {
                return Err(PipelineError::ResumeBeyondEnd { expected: self.skip, available: self.next_idx });
            }
            for event in &events {
                check_lookahead(event, step_ts)?;
                let _ = self.signal.on_event(event);
                self.next_idx += 1;
                self.report.skipped += 1;
            }
        }
        logging::info(
            Domain::Checkpoint,
            "resumed",
            obj(&[
                ("run_id", v_str(&self.checkpoint.run_id)),
                ("skipped", v_int(self.skip)),
            ]),
        );
        Ok(())
    }

    fn process_input(&mut self, event: &MarketEvent) -> Result<(), PipelineError> {
        let idx = self.next_idx;
        let drafts = self.signal.on_event(event);
        let intents: Vec<OrderIntent> = drafts
            .into_iter()
            .enumerate()
            .map(|(n, draft)| build_intent(event, idx, n, draft))
            .collect();

        for intent in &intents {
            self.intents.insert(intent.clone());
            self.bus.publish(topics::ORDER_INTENTS, "order_intent", &intent.trace_id, Payload::Intent(intent.clone()));
        }
        self.report.events += 1;
        self.report.intents += intents.len() as u64;

        let drained = self.drain();
        for intent in &intents {
            self.intents.remove(&intent.event_id);
        }
        drained?;

        self.checkpoint = self.checkpoint.update(idx as i64);
        if let Some(path) = &self.checkpoint_path {
            self.checkpoint.save_atomic(path)?;
        }
        self.report.last_processed_idx = self.checkpoint.last_processed_idx;
        self.next_idx += 1;
        Ok(())
    }

    /// Run workers in stage order until every topic is empty.
    fn drain(&mut self) -> Result<(), PipelineError> {
        let cap = self.config.max_drain_iterations;
        let mut iteration = 0usize;
        loop {
            let pending = self.bus.total_pending();
            if pending == 0 {
                return Ok(());
            }
            iteration += 1;
            if iteration > cap {
                logging::error(
                    Domain::Orchestrator,
                    "drain_cap_exceeded",
                    obj(&[("cap", v_int(cap as u64)), ("pending", v_int(pending as u64))]),
                );
                return Err(PipelineError::DrainCapExceeded { cap, pending });
            }
            self.report.drain_iterations += 1;

            let mut progress = 0usize;
            for worker in self.workers.iter_mut() {
                progress += worker
                    .step(&mut self.bus, self.config.worker_batch.max(1))
                    .map_err(|source| PipelineError::Worker { worker: worker.name(), source })?;
            }
            if progress == 0 {
                let pending = self.bus.total_pending();
                logging::error(
                    Domain::Orchestrator,
                    "deadlock",
                    obj(&[("iteration", v_int(iteration as u64)), ("pending", v_int(pending as u64))]),
                );
                return Err(PipelineError::Deadlock { iteration, pending });
            }
        }
    }

    fn snapshot(&mut self) -> RunReport {
        let mut totals = WorkerStats::default();
        self.report.workers.clear();
        for worker in &self.workers {
            let stats = worker.stats();
            totals = totals.merge(&stats);
            self.report.workers.insert(worker.name().to_string(), stats);
        }
        self.report.decisions_allowed = totals.allowed;
        self.report.decisions_denied = totals.denied;
        self.report.reports = totals.executed;
        self.report.duplicates = totals.duplicates;
        self.report.retry_exhausted = totals.retry_exhausted;
        self.report.failed = totals.failed;
        self.report.fills_applied = totals.fills_applied;

        logging::info(
            Domain::Orchestrator,
            "run_complete",
            obj(&[
                ("run_id", v_str(&self.report.run_id)),
                ("steps", v_int(self.report.steps)),
                ("events", v_int(self.report.events)),
                ("intents", v_int(self.report.intents)),
                ("reports", v_int(self.report.reports)),
                ("stopped", serde_json::json!(self.report.stopped)),
            ]),
        );
        self.report.clone()
    }
}

fn check_lookahead(event: &MarketEvent, step_ts: u64) -> Result<(), PipelineError> {
    if event.ts > step_ts {
        logging::error(
            Domain::Orchestrator,
            "lookahead",
            obj(&[
                ("event_id", v_str(&event.event_id)),
                ("event_ts", v_int(event.ts)),
                ("step_ts", v_int(step_ts)),
            ]),
        );
        return Err(PipelineError::Lookahead {
            event_id: event.event_id.clone(),
            event_ts: event.ts,
            step_ts,
        });
    }
    Ok(())
}

fn build_intent(event: &MarketEvent, idx: u64, n: usize, draft: IntentDraft) -> OrderIntent {
    OrderIntent {
        event_id: intent_id(&draft.symbol, event.ts, idx, n),
        trace_id: trace_id(&event.event_id),
        ref_market_event_id: event.event_id.clone(),
        ts: event.ts,
        symbol: draft.symbol,
        side: draft.side,
        qty: draft.qty,
        order_type: draft.order_type,
        limit_price: draft.limit_price,
        notional: draft.notional,
        meta: draft.meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AllowAll, PaperExchange, VecMarketData};
    use crate::events::Side;
    use crate::idempotency::TtlIdempotencyStore;
    use crate::ledger::PositionLedger;
    use crate::reliability::RetryPolicy;
    use crate::workers::{DrainWorker, ExecWorker, PositionWorker, RiskWorker};
    use std::time::Duration;

    /// Buys one unit on every event.
    struct EveryTick;

    impl SignalSource for EveryTick {
        fn on_event(&mut self, e: &MarketEvent) -> Vec<IntentDraft> {
            vec![IntentDraft::market(&e.symbol, Side::Buy, 1.0, e.price)]
        }
    }

    fn events(n: u64) -> Vec<MarketEvent> {
        (0..n)
            .map(|i| MarketEvent {
                event_id: format!("M-{}", i),
                ts: 1_000 + i * 10,
                symbol: "BTCUSDT".into(),
                price: 100.0 + i as f64,
                volume: 1.0,
            })
            .collect()
    }

    fn pipeline(n: u64, ledger: Arc<PositionLedger>) -> OrchestratorBuilder {
        let clock = SimClock::new(0);
        let cache = IntentCache::new();
        let store = TtlIdempotencyStore::new(Duration::from_secs(60), Arc::new(clock.clone()));
        let exec = ExecWorker::new(
            Box::new(PaperExchange::default()),
            Box::new(store),
            cache.clone(),
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        );
        Orchestrator::builder(Box::new(VecMarketData::new(events(n))), Box::new(EveryTick))
            .clock(clock)
            .intent_cache(cache)
            .worker(Box::new(PositionWorker::new(ledger)))
            .worker(Box::new(exec))
            .worker(Box::new(RiskWorker::new(Box::new(AllowAll))))
    }

    #[test]
    fn test_missing_consumer_rejected() {
        let err = Orchestrator::builder(Box::new(VecMarketData::default()), Box::new(EveryTick))
            .worker(Box::new(RiskWorker::new(Box::new(AllowAll))))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::MissingConsumer(t) if t == topics::RISK_DECISIONS));
    }

    #[test]
    fn test_duplicate_consumer_rejected() {
        let ledger = Arc::new(PositionLedger::open_in_memory().unwrap());
        let err = pipeline(1, ledger)
            .worker(Box::new(DrainWorker::new(topics::EXECUTION_REPORTS)))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::DuplicateConsumer(_)));
    }

    #[test]
    fn test_workers_sorted_by_stage() {
        let ledger = Arc::new(PositionLedger::open_in_memory().unwrap());
        let orch = pipeline(1, ledger).build().unwrap();
        let names: Vec<_> = orch.workers.iter().map(|w| w.name()).collect();
        assert_eq!(names, vec!["risk", "exec", "position"]);
    }

    #[test]
    fn test_full_run_fills_every_intent() {
        let ledger = Arc::new(PositionLedger::open_in_memory().unwrap());
        let mut orch = pipeline(5, ledger.clone()).build().unwrap();
        let report = orch.run(None).unwrap();
        assert_eq!(report.events, 5);
        assert_eq!(report.intents, 5);
        assert_eq!(report.reports, 5);
        assert_eq!(report.fills_applied, 5);
        assert_eq!(report.last_processed_idx, 4);
        assert_eq!(orch.bus().total_pending(), 0);
        assert!(orch.intents.is_empty());
        let pos = ledger.get_position("BTCUSDT").unwrap().unwrap();
        assert!((pos.qty - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_steps_and_clock() {
        let ledger = Arc::new(PositionLedger::open_in_memory().unwrap());
        let mut orch = pipeline(5, ledger).build().unwrap();
        let report = orch.run(Some(2)).unwrap();
        assert_eq!(report.steps, 2);
        assert_eq!(orch.checkpoint().last_processed_idx, 1);
        assert_eq!(crate::clock::Clock::now_ms(&orch.clock), 1_010);
    }

    #[test]
    fn test_stop_before_first_step() {
        let ledger = Arc::new(PositionLedger::open_in_memory().unwrap());
        let mut orch = pipeline(5, ledger).build().unwrap();
        orch.stop_signal().stop();
        let report = orch.run(None).unwrap();
        assert!(report.stopped);
        assert_eq!(report.events, 0);
    }

    #[test]
    fn test_resume_beyond_end() {
        let ledger = Arc::new(PositionLedger::open_in_memory().unwrap());
        let cp = Checkpoint::create_new("r").update(9);
        let mut orch = pipeline(3, ledger).resume_from(cp).build().unwrap();
        let err = orch.run(None).unwrap_err();
        assert!(matches!(err, PipelineError::ResumeBeyondEnd { expected: 10, available: 3 }));
    }
}
