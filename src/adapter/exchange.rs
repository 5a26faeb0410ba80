use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::events::{ExecutionContext, ExecutionReport, Meta, OrderIntent, OrderType, ReportStatus, RiskDecision, Side};
use crate::fault::FaultPlan;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// Timeouts, dropped connections, rate limits. Safe to retry.
    #[error("transient venue failure: {0}")]
    Transient(String),
    /// The venue refused the order; retrying cannot help.
    #[error("venue rejected order: {0}")]
    Rejected(String),
}

impl ExecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Transient(_))
    }
}

pub trait ExchangeAdapter: Send {
    fn submit(
        &mut self,
        intent: &OrderIntent,
        decision: &RiskDecision,
        ctx: &ExecutionContext,
        report_event_id: &str,
        extra_meta: &Meta,
    ) -> Result<ExecutionReport, ExecError>;
}

/// Immediate full fills at the resolved price, adjusted for slippage, with a
/// proportional fee. Limit orders fill at their limit without slippage.
#[derive(Debug, Clone, Copy)]
pub struct PaperExchange {
    pub fee_bps: f64,
    pub slippage_bps: f64,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self { fee_bps: 1.0, slippage_bps: 0.0 }
    }
}

impl PaperExchange {
    fn fill_price(&self, intent: &OrderIntent, ctx: &ExecutionContext) -> f64 {
        if intent.order_type == OrderType::Limit {
            return ctx.resolved_price;
        }
        let slip = self.slippage_bps / 10_000.0;
        match intent.side {
            Side::Buy => ctx.resolved_price * (1.0 + slip),
            Side::Sell => ctx.resolved_price * (1.0 - slip),
        }
    }
}

impl ExchangeAdapter for PaperExchange {
    fn submit(
        &mut self,
        intent: &OrderIntent,
        decision: &RiskDecision,
        ctx: &ExecutionContext,
        report_event_id: &str,
        extra_meta: &Meta,
    ) -> Result<ExecutionReport, ExecError> {
        if intent.qty <= 0.0 || !intent.qty.is_finite() {
            return Err(ExecError::Rejected(format!("bad qty {}", intent.qty)));
        }
        let price = self.fill_price(intent, ctx);
        let mut meta = extra_meta.clone();
        meta.insert("venue".into(), "paper".into());
        Ok(ExecutionReport {
            event_id: report_event_id.to_string(),
            trace_id: decision.trace_id.clone(),
            ref_decision_event_id: decision.event_id.clone(),
            ref_intent_event_id: intent.event_id.clone(),
            ts: ctx.ts,
            symbol: intent.symbol.clone(),
            side: intent.side,
            status: ReportStatus::Filled,
            filled_qty: intent.qty,
            avg_price: Some(price),
            fee: intent.qty * price * self.fee_bps / 10_000.0,
            meta,
        })
    }
}

/// Wraps a venue and injects transient failures on a deterministic schedule.
pub struct FlakyExchange<X> {
    inner: X,
    plan: FaultPlan,
    calls: Arc<AtomicU64>,
}

impl<X: ExchangeAdapter> FlakyExchange<X> {
    pub fn new(inner: X, plan: FaultPlan) -> Self {
        Self { inner, plan, calls: Arc::new(AtomicU64::new(0)) }
    }

    /// Shared counter of every `submit` call, failed or not.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }
}

impl<X: ExchangeAdapter> ExchangeAdapter for FlakyExchange<X> {
    fn submit(
        &mut self,
        intent: &OrderIntent,
        decision: &RiskDecision,
        ctx: &ExecutionContext,
        report_event_id: &str,
        extra_meta: &Meta,
    ) -> Result<ExecutionReport, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.plan.next_attempt_fails(&ctx.op_key) {
            return Err(ExecError::Transient(format!("injected timeout for {}", ctx.op_key)));
        }
        self.inner.submit(intent, decision, ctx, report_event_id, extra_meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(order_type: OrderType, side: Side) -> (OrderIntent, RiskDecision, ExecutionContext) {
        let intent = OrderIntent {
            event_id: "I-1".into(),
            trace_id: "T-1".into(),
            ref_market_event_id: "M-1".into(),
            ts: 5,
            symbol: "BTCUSDT".into(),
            side,
            qty: 2.0,
            order_type,
            limit_price: Some(100.0),
            notional: None,
            meta: Meta::new(),
        };
        let decision = RiskDecision {
            event_id: "D-I-1".into(),
            trace_id: "T-1".into(),
            ref_intent_event_id: "I-1".into(),
            ts: 5,
            allowed: true,
            reasons: vec![],
        };
        let ctx = ExecutionContext { ts: 5, resolved_price: 100.0, op_key: "exec:I-1".into() };
        (intent, decision, ctx)
    }

    #[test]
    fn test_paper_fill_with_slippage_and_fee() {
        let mut venue = PaperExchange { fee_bps: 10.0, slippage_bps: 50.0 };
        let (i, d, c) = fixture(OrderType::Market, Side::Buy);
        let r = venue.submit(&i, &d, &c, "R-1", &Meta::new()).unwrap();
        assert_eq!(r.status, ReportStatus::Filled);
        assert_eq!(r.ref_intent_event_id, "I-1");
        assert!((r.avg_price.unwrap() - 100.5).abs() < 1e-9);
        assert!((r.fee - 2.0 * 100.5 * 0.001).abs() < 1e-9);

        let (i, d, c) = fixture(OrderType::Market, Side::Sell);
        let r = venue.submit(&i, &d, &c, "R-2", &Meta::new()).unwrap();
        assert!((r.avg_price.unwrap() - 99.5).abs() < 1e-9);
    }

    #[test]
    fn test_limit_orders_skip_slippage() {
        let mut venue = PaperExchange { fee_bps: 0.0, slippage_bps: 50.0 };
        let (i, d, c) = fixture(OrderType::Limit, Side::Buy);
        let r = venue.submit(&i, &d, &c, "R-1", &Meta::new()).unwrap();
        assert_eq!(r.avg_price, Some(100.0));
    }

    #[test]
    fn test_flaky_fails_then_delegates() {
        let mut venue = FlakyExchange::new(PaperExchange::default(), FaultPlan::fail_first(2));
        let calls = venue.call_counter();
        let (i, d, c) = fixture(OrderType::Market, Side::Buy);
        assert!(venue.submit(&i, &d, &c, "R-1", &Meta::new()).unwrap_err().is_transient());
        assert!(venue.submit(&i, &d, &c, "R-1", &Meta::new()).unwrap_err().is_transient());
        assert!(venue.submit(&i, &d, &c, "R-1", &Meta::new()).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
