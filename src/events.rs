//! Typed payloads that cross the bus.
//!
//! Every payload is built completely before it is published and never mutated
//! afterwards. Ids are derived from their inputs so a resumed run produces the
//! same ids as an uninterrupted one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type Meta = BTreeMap<String, String>;

/// Well-known topic names.
pub mod topics {
    pub const ORDER_INTENTS: &str = "order_intents";
    pub const RISK_DECISIONS: &str = "risk_decisions";
    pub const EXECUTION_REPORTS: &str = "execution_reports";

    /// Topics the pipeline publishes to, in stage order.
    pub const PIPELINE: [&str; 3] = [ORDER_INTENTS, RISK_DECISIONS, EXECUTION_REPORTS];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized side '{0}'")]
pub struct ParseSideError(pub String);

impl FromStr for Side {
    type Err = ParseSideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(ParseSideError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    New,
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
}

impl ReportStatus {
    /// Whether the report carries a fill the ledger must apply.
    pub fn is_fill(&self) -> bool {
        matches!(self, ReportStatus::Filled | ReportStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub event_id: String,
    pub ts: u64,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub event_id: String,
    pub trace_id: String,
    pub ref_market_event_id: String,
    pub ts: u64,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub notional: Option<f64>,
    pub meta: Meta,
}

/// Meta keys consulted, in order, when an intent carries no explicit price.
pub const PRICE_META_KEYS: [&str; 3] = ["ref_price", "mark_price", "last_price"];

impl OrderIntent {
    /// Fill price by precedence: limit price, then notional / qty, then the
    /// first usable price in `meta`. `None` if nothing valid is present.
    pub fn resolve_price(&self) -> Option<f64> {
        let valid = |p: f64| p.is_finite() && p > 0.0;
        if let Some(p) = self.limit_price.filter(|p| valid(*p)) {
            return Some(p);
        }
        if let Some(n) = self.notional {
            if valid(n) && valid(self.qty) && valid(n / self.qty) {
                return Some(n / self.qty);
            }
        }
        PRICE_META_KEYS
            .iter()
            .filter_map(|k| self.meta.get(*k))
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .find(|p| valid(*p))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub event_id: String,
    pub trace_id: String,
    pub ref_intent_event_id: String,
    pub ts: u64,
    pub allowed: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub event_id: String,
    pub trace_id: String,
    pub ref_decision_event_id: String,
    pub ref_intent_event_id: String,
    pub ts: u64,
    pub symbol: String,
    pub side: Side,
    pub status: ReportStatus,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
    pub fee: f64,
    pub meta: Meta,
}

/// Context handed to the exchange adapter alongside an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub ts: u64,
    pub resolved_price: f64,
    pub op_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Intent(OrderIntent),
    Decision(RiskDecision),
    Report(ExecutionReport),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Intent(_) => "intent",
            Payload::Decision(_) => "decision",
            Payload::Report(_) => "report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event_type: String,
    pub trace_id: String,
    pub sequence: u64,
    pub payload: Payload,
}

// =============================================================================
// Id helpers
// =============================================================================

/// Intent id: I-<symbol>-<ts>-<input idx>-<n>
pub fn intent_id(symbol: &str, ts: u64, input_idx: u64, n: usize) -> String {
    format!("I-{}-{}-{}-{}", symbol, ts, input_idx, n)
}

pub fn decision_id(intent_event_id: &str) -> String {
    format!("D-{}", intent_event_id)
}

pub fn report_id(decision_event_id: &str) -> String {
    format!("R-{}", decision_event_id)
}

/// Trace id shared by every event derived from one market event.
pub fn trace_id(market_event_id: &str) -> String {
    format!("T-{}", market_event_id)
}
