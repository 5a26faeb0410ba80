use std::sync::Arc;

use super::{unexpected, Worker, WorkerError, WorkerStats};
use crate::adapter::{PortfolioContext, RiskError, RiskEvaluator, RiskVerdict};
use crate::bus::EventBus;
use crate::events::{decision_id, topics, OrderIntent, Payload, RiskDecision};
use crate::ledger::PositionLedger;
use crate::logging::{self, obj, v_str, Domain};

/// Intents in, exactly one decision out per intent, no matter what the risk
/// collaborator does.
pub struct RiskWorker {
    evaluator: Box<dyn RiskEvaluator>,
    ledger: Option<Arc<PositionLedger>>,
    stats: WorkerStats,
}

impl RiskWorker {
    pub fn new(evaluator: Box<dyn RiskEvaluator>) -> Self {
        Self { evaluator, ledger: None, stats: WorkerStats::default() }
    }

    /// Read portfolio context for each intent from `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<PositionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    fn context(&self, symbol: &str) -> Result<PortfolioContext, RiskError> {
        let Some(ledger) = &self.ledger else {
            return Ok(PortfolioContext::default());
        };
        let unavailable = |e: crate::ledger::LedgerError| RiskError::Unavailable(e.to_string());
        let position = ledger.get_position(symbol).map_err(unavailable)?;
        let open_positions = ledger.list_positions().map_err(unavailable)?.len();
        Ok(PortfolioContext {
            position_qty: position.as_ref().map_or(0.0, |p| p.qty),
            avg_price: position.and_then(|p| p.avg_price),
            open_positions,
        })
    }

    fn decide(&mut self, intent: &OrderIntent) -> RiskDecision {
        let verdict = self
            .context(&intent.symbol)
            .and_then(|ctx| self.evaluator.evaluate(intent, &ctx))
            .unwrap_or_else(|e| {
                self.stats.risk_errors += 1;
                logging::error(
                    Domain::Risk,
                    "evaluator_error",
                    obj(&[
                        ("trace_id", v_str(&intent.trace_id)),
                        ("event_id", v_str(&intent.event_id)),
                        ("error", v_str(&e.to_string())),
                    ]),
                );
                RiskVerdict::deny(vec![format!("risk_engine_error: {}", e)])
            });

        if verdict.allowed {
            self.stats.allowed += 1;
        } else {
            self.stats.denied += 1;
        }
        RiskDecision {
            event_id: decision_id(&intent.event_id),
            trace_id: intent.trace_id.clone(),
            ref_intent_event_id: intent.event_id.clone(),
            ts: intent.ts,
            allowed: verdict.allowed,
            reasons: verdict.reasons,
        }
    }
}

impl Worker for RiskWorker {
    fn name(&self) -> &'static str {
        "risk"
    }

    fn topic(&self) -> &str {
        topics::ORDER_INTENTS
    }

    fn step(&mut self, bus: &mut EventBus, max_items: usize) -> Result<usize, WorkerError> {
        let batch = bus.poll(topics::ORDER_INTENTS, max_items);
        for env in &batch {
            let Payload::Intent(intent) = &env.payload else {
                return Err(unexpected(env));
            };
            self.stats.consumed += 1;
            let decision = self.decide(intent);
            logging::debug(
                Domain::Risk,
                "decision",
                obj(&[
                    ("trace_id", v_str(&decision.trace_id)),
                    ("event_id", v_str(&decision.event_id)),
                    ("allowed", serde_json::json!(decision.allowed)),
                    ("reasons", serde_json::json!(decision.reasons)),
                ]),
            );
            let trace = decision.trace_id.clone();
            bus.publish(topics::RISK_DECISIONS, "risk_decision", &trace, Payload::Decision(decision));
            self.stats.published += 1;
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
    use crate::adapter::{AllowAll, LimitRiskEvaluator};
    use crate::events::{Meta, OrderType, Side};

    struct Broken;

    impl RiskEvaluator for Broken {
        fn evaluate(&self, _: &OrderIntent, _: &PortfolioContext) -> Result<RiskVerdict, RiskError> {
            Err(RiskError::Unavailable("model not loaded".into()))
        }
    }

    fn intent(id: &str, qty: f64) -> OrderIntent {
        let mut meta = Meta::new();
        meta.insert("ref_price".into(), "100".into());
        OrderIntent {
            event_id: id.into(),
            trace_id: format!("T-{}", id),
            ref_market_event_id: "M".into(),
            ts: 10,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            notional: None,
            meta,
        }
    }

    fn decisions(bus: &mut EventBus) -> Vec<RiskDecision> {
        bus.poll(topics::RISK_DECISIONS, usize::MAX)
            .into_iter()
            .map(|e| match e.payload {
                Payload::Decision(d) => d,
                other => panic!("unexpected {}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_one_decision_per_intent_in_order() {
        let mut bus = EventBus::new();
        for (id, qty) in [("I-1", 1.0), ("I-2", 500.0), ("I-3", 2.0)] {
            bus.publish(topics::ORDER_INTENTS, "order_intent", "T", Payload::Intent(intent(id, qty)));
        }
        let mut w = RiskWorker::new(Box::new(LimitRiskEvaluator::default()));
        assert_eq!(w.step(&mut bus, 10).unwrap(), 3);
        let out = decisions(&mut bus);
        assert_eq!(out.iter().map(|d| d.ref_intent_event_id.as_str()).collect::<Vec<_>>(), vec!["I-1", "I-2", "I-3"]);
        assert!(out[0].allowed && !out[1].allowed && out[2].allowed);
        assert_eq!(out[0].event_id, "D-I-1");
        assert_eq!(w.stats().denied, 1);
    }

    #[test]
    fn test_evaluator_error_still_emits_denial() {
        let mut bus = EventBus::new();
        bus.publish(topics::ORDER_INTENTS, "order_intent", "T", Payload::Intent(intent("I-1", 1.0)));
        let mut w = RiskWorker::new(Box::new(Broken));
        assert_eq!(w.step(&mut bus, 10).unwrap(), 1);
        let out = decisions(&mut bus);
        assert_eq!(out.len(), 1);
        assert!(!out[0].allowed);
        assert!(out[0].reasons[0].starts_with("risk_engine_error"));
        assert_eq!(w.stats().risk_errors, 1);
    }

    #[test]
    fn test_context_comes_from_ledger() {
        let ledger = Arc::new(PositionLedger::open_in_memory().unwrap());
        ledger.apply_fill("BTCUSDT", Side::Buy, 9.0, 100.0).unwrap();
        let limits = LimitRiskEvaluator { max_abs_position: 10.0, ..Default::default() };
        let mut w = RiskWorker::new(Box::new(limits)).with_ledger(ledger);
        let mut bus = EventBus::new();
        bus.publish(topics::ORDER_INTENTS, "order_intent", "T", Payload::Intent(intent("I-1", 2.0)));
        w.step(&mut bus, 10).unwrap();
        let out = decisions(&mut bus);
        assert!(!out[0].allowed, "9 + 2 breaches a 10 lot cap");
    }

    #[test]
    fn test_wrong_payload_fails_fast() {
        let mut bus = EventBus::new();
        bus.publish(topics::ORDER_INTENTS, "oops", "T", Payload::Decision(RiskDecision {
            event_id: "D".into(),
            trace_id: "T".into(),
            ref_intent_event_id: "I".into(),
            ts: 0,
            allowed: true,
            reasons: vec![],
        }));
        let mut w = RiskWorker::new(Box::new(AllowAll));
        assert!(matches!(w.step(&mut bus, 10), Err(WorkerError::UnexpectedPayload { .. })));
    }
}
