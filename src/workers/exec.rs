use std::sync::Arc;
use std::time::Duration;

use super::{unexpected, IntentCache, Worker, WorkerError, WorkerStats};
use crate::adapter::{ExchangeAdapter, ExecError};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::events::{report_id, topics, ExecutionContext, Meta, Payload, RiskDecision};
use crate::idempotency::IdempotencyStore;
use crate::logging::{self, obj, v_int, v_num, v_str, Domain};
use crate::reliability::retry::{self, RetryPolicy};

/// What happened to one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Executed,
    SkippedDenied,
    SkippedDuplicate,
    SkippedRetryExhausted,
    Failed,
}

pub type Sleeper = Box<dyn FnMut(Duration) + Send>;

pub struct ExecWorker {
    exchange: Box<dyn ExchangeAdapter>,
    store: Box<dyn IdempotencyStore>,
    intents: IntentCache,
    policy: RetryPolicy,
    sleep: Sleeper,
    clock: Arc<dyn Clock>,
    stats: WorkerStats,
}

impl ExecWorker {
    pub fn new(
        exchange: Box<dyn ExchangeAdapter>,
        store: Box<dyn IdempotencyStore>,
        intents: IntentCache,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            exchange,
            store,
            intents,
            policy,
            sleep: Box::new(retry::thread_sleep),
            clock,
            stats: WorkerStats::default(),
        }
    }

    /// Replace the backoff sleeper (tests record delays instead of waiting).
    pub fn with_sleeper(mut self, sleep: Sleeper) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn op_key(intent_event_id: &str) -> String {
        format!("exec:{}", intent_event_id)
    }

    /// Run one decision through the exec path. Only a successful submission
    /// publishes anything.
    pub fn process_decision(&mut self, bus: &mut EventBus, decision: &RiskDecision) -> Result<ExecOutcome, WorkerError> {
        if !decision.allowed {
            self.stats.ignored += 1;
            return Ok(ExecOutcome::SkippedDenied);
        }

        let intent = self
            .intents
            .get(&decision.ref_intent_event_id)
            .ok_or_else(|| WorkerError::IntentCacheMiss {
                decision_event_id: decision.event_id.clone(),
                intent_event_id: decision.ref_intent_event_id.clone(),
            })?;
        let price = intent
            .resolve_price()
            .ok_or_else(|| WorkerError::MissingPrice { event_id: intent.event_id.clone() })?;

        let op_key = Self::op_key(&decision.ref_intent_event_id);
        if !self.store.mark_once(&op_key)? {
            self.stats.duplicates += 1;
            logging::info(
                Domain::Exec,
                "duplicate_skipped",
                obj(&[
                    ("trace_id", v_str(&decision.trace_id)),
                    ("op_key", v_str(&op_key)),
                    ("event_id", v_str(&decision.event_id)),
                ]),
            );
            return Ok(ExecOutcome::SkippedDuplicate);
        }

        let ctx = ExecutionContext {
            ts: self.clock.now_ms(),
            resolved_price: price,
            op_key: op_key.clone(),
        };
        let report_event_id = report_id(&decision.event_id);
        let mut extra = Meta::new();
        extra.insert("op_key".into(), op_key.clone());
        extra.insert("decision_event_id".into(), decision.event_id.clone());

        let exchange = &mut self.exchange;
        let result = retry::execute(&self.policy, &op_key, ExecError::is_transient, &mut *self.sleep, || {
            exchange.submit(&intent, decision, &ctx, &report_event_id, &extra)
        });

        match result {
            Ok((report, attempts)) => {
                logging::info(
                    Domain::Exec,
                    "executed",
                    obj(&[
                        ("trace_id", v_str(&report.trace_id)),
                        ("op_key", v_str(&op_key)),
                        ("event_id", v_str(&report.event_id)),
                        ("symbol", v_str(&report.symbol)),
                        ("side", v_str(report.side.as_str())),
                        ("filled_qty", v_num(report.filled_qty)),
                        ("attempts", v_int(attempts as u64)),
                    ]),
                );
                let trace = report.trace_id.clone();
                bus.publish(topics::EXECUTION_REPORTS, "execution_report", &trace, Payload::Report(report));
                self.stats.executed += 1;
                self.stats.published += 1;
                Ok(ExecOutcome::Executed)
            }
            Err(err) => {
                let exhausted = err.is_exhausted();
                logging::warn(
                    Domain::Exec,
                    if exhausted { "dropped_retry_exhausted" } else { "dropped_failed" },
                    obj(&[
                        ("trace_id", v_str(&decision.trace_id)),
                        ("op_key", v_str(&op_key)),
                        ("event_id", v_str(&decision.event_id)),
                        ("attempts", v_int(err.attempts() as u64)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                if exhausted {
                    self.stats.retry_exhausted += 1;
                    Ok(ExecOutcome::SkippedRetryExhausted)
                } else {
                    self.stats.failed += 1;
                    Ok(ExecOutcome::Failed)
                }
            }
        }
    }
}

impl Worker for ExecWorker {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn topic(&self) -> &str {
        topics::RISK_DECISIONS
    }

    fn step(&mut self, bus: &mut EventBus, max_items: usize) -> Result<usize, WorkerError> {
        let batch = bus.poll(topics::RISK_DECISIONS, max_items);
        for env in &batch {
            let Payload::Decision(decision) = &env.payload else {
                return Err(unexpected(env));
            };
            self.stats.consumed += 1;
            self.process_decision(bus, decision)?;
        }
        Ok(batch.len())
    }

    fn stats(&self) -> WorkerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use crate::adapter::{FlakyExchange, PaperExchange};
    use crate::clock::SimClock;
    use crate::events::{decision_id, Meta, OrderIntent, OrderType, Side};
    use crate::fault::FaultPlan;
    use crate::idempotency::TtlIdempotencyStore;
    use crate::reliability::retry::JitterMode;

    struct Rejecting;

    impl ExchangeAdapter for Rejecting {
        fn submit(
            &mut self,
            _: &OrderIntent,
            _: &RiskDecision,
            _: &ExecutionContext,
            _: &str,
            _: &Meta,
        ) -> Result<crate::events::ExecutionReport, ExecError> {
            Err(ExecError::Rejected("insufficient margin".into()))
        }
    }

    fn intent(id: &str) -> OrderIntent {
        let mut meta = Meta::new();
        meta.insert("ref_price".into(), "100".into());
        OrderIntent {
            event_id: id.into(),
            trace_id: "T-M-1".into(),
            ref_market_event_id: "M-1".into(),
            ts: 1_000,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            qty: 1.0,
            order_type: OrderType::Market,
            limit_price: None,
            notional: None,
            meta,
        }
    }

    fn decision(intent_id: &str, allowed: bool) -> RiskDecision {
        RiskDecision {
            event_id: decision_id(intent_id),
            trace_id: "T-M-1".into(),
            ref_intent_event_id: intent_id.into(),
            ts: 1_000,
            allowed,
            reasons: vec![],
        }
    }

    fn worker(exchange: Box<dyn ExchangeAdapter>, cache: IntentCache, delays: Arc<Mutex<Vec<Duration>>>) -> ExecWorker {
        let clock = Arc::new(SimClock::new(1_000));
        let store = TtlIdempotencyStore::new(Duration::from_secs(3600), clock.clone());
        let policy = RetryPolicy { max_attempts: 5, jitter: JitterMode::None, ..Default::default() };
        ExecWorker::new(exchange, Box::new(store), cache, policy, clock)
            .with_sleeper(Box::new(move |d| delays.lock().unwrap().push(d)))
    }

    fn reports(bus: &mut EventBus) -> usize {
        bus.poll(topics::EXECUTION_REPORTS, usize::MAX).len()
    }

    #[test]
    fn test_duplicate_decision_executes_once() {
        let cache = IntentCache::new();
        cache.insert(intent("I-1"));
        let mut w = worker(Box::new(PaperExchange::default()), cache, Arc::default());
        let mut bus = EventBus::new();
        let d = decision("I-1", true);
        assert_eq!(w.process_decision(&mut bus, &d).unwrap(), ExecOutcome::Executed);
        assert_eq!(w.process_decision(&mut bus, &d).unwrap(), ExecOutcome::SkippedDuplicate);
        assert_eq!(reports(&mut bus), 1);
        assert_eq!(w.stats().duplicates, 1);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let cache = IntentCache::new();
        cache.insert(intent("I-1"));
        let flaky = FlakyExchange::new(PaperExchange::default(), FaultPlan::fail_first(2));
        let calls = flaky.call_counter();
        let delays = Arc::new(Mutex::new(Vec::new()));
        let mut w = worker(Box::new(flaky), cache, delays.clone());
        let mut bus = EventBus::new();
        assert_eq!(w.process_decision(&mut bus, &decision("I-1", true)).unwrap(), ExecOutcome::Executed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*delays.lock().unwrap(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(reports(&mut bus), 1);
    }

    #[test]
    fn test_retry_exhaustion_drops_without_report() {
        let cache = IntentCache::new();
        cache.insert(intent("I-1"));
        let flaky = FlakyExchange::new(PaperExchange::default(), FaultPlan::fail_first(10));
        let calls = flaky.call_counter();
        let mut w = worker(Box::new(flaky), cache, Arc::default());
        let mut bus = EventBus::new();
        let out = w.process_decision(&mut bus, &decision("I-1", true)).unwrap();
        assert_eq!(out, ExecOutcome::SkippedRetryExhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(reports(&mut bus), 0);
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let cache = IntentCache::new();
        cache.insert(intent("I-1"));
        let delays = Arc::new(Mutex::new(Vec::new()));
        let mut w = worker(Box::new(Rejecting), cache, delays.clone());
        let mut bus = EventBus::new();
        assert_eq!(w.process_decision(&mut bus, &decision("I-1", true)).unwrap(), ExecOutcome::Failed);
        assert!(delays.lock().unwrap().is_empty());
        assert_eq!(w.stats().failed, 1);
    }

    #[test]
    fn test_denied_decision_dropped() {
        let mut w = worker(Box::new(PaperExchange::default()), IntentCache::new(), Arc::default());
        let mut bus = EventBus::new();
        assert_eq!(w.process_decision(&mut bus, &decision("I-1", false)).unwrap(), ExecOutcome::SkippedDenied);
        assert_eq!(reports(&mut bus), 0);
    }

    #[test]
    fn test_cache_miss_fails_fast() {
        let mut w = worker(Box::new(PaperExchange::default()), IntentCache::new(), Arc::default());
        let mut bus = EventBus::new();
        let err = w.process_decision(&mut bus, &decision("I-404", true)).unwrap_err();
        assert!(matches!(err, WorkerError::IntentCacheMiss { .. }));
    }

    #[test]
    fn test_missing_price_fails_fast() {
        let cache = IntentCache::new();
        let mut i = intent("I-1");
        i.meta.clear();
        cache.insert(i);
        let mut w = worker(Box::new(PaperExchange::default()), cache, Arc::default());
        let mut bus = EventBus::new();
        let err = w.process_decision(&mut bus, &decision("I-1", true)).unwrap_err();
        assert!(matches!(err, WorkerError::MissingPrice { .. }));
    }

    #[test]
    fn test_report_ids_and_meta() {
        let cache = IntentCache::new();
        cache.insert(intent("I-1"));
        let mut w = worker(Box::new(PaperExchange::default()), cache, Arc::default());
        let mut bus = EventBus::new();
        w.process_decision(&mut bus, &decision("I-1", true)).unwrap();
        let env = bus.poll(topics::EXECUTION_REPORTS, 1).remove(0);
        assert_eq!(env.event_type, "execution_report");
        let Payload::Report(r) = env.payload else { panic!("expected report") };
        assert_eq!(r.event_id, "R-D-I-1");
        assert_eq!(r.ref_intent_event_id, "I-1");
        assert_eq!(r.meta.get("op_key").map(String::as_str), Some("exec:I-1"));
        assert_eq!(r.ts, 1_000);
    }
}
