use std::collections::HashMap;

use crate::events::{MarketEvent, Meta, OrderType, Side};

/// Everything about an order the signal decides. The orchestrator turns a
/// draft into a fully identified `OrderIntent` before publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentDraft {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub notional: Option<f64>,
    pub meta: Meta,
}

impl IntentDraft {
    pub fn market(symbol: &str, side: Side, qty: f64, ref_price: f64) -> Self {
        let mut meta = Meta::new();
        meta.insert("ref_price".into(), ref_price.to_string());
        Self {
            symbol: symbol.to_string(),
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            notional: None,
            meta,
        }
    }
}

pub trait SignalSource: Send {
    fn on_event(&mut self, event: &MarketEvent) -> Vec<IntentDraft>;
}

/// Price / EMA crossover. Emits a market order only when the side of the
/// price relative to its EMA flips; the first event per symbol seeds the EMA.
#[derive(Debug, Clone)]
pub struct CrossSignal {
    alpha: f64,
    qty: f64,
    ema: HashMap<String, f64>,
    last_side: HashMap<String, Side>,
}

impl CrossSignal {
    pub fn new(period: u32, qty: f64) -> Self {
        Self {
            alpha: 2.0 / (period.max(1) as f64 + 1.0),
            qty,
            ema: HashMap::new(),
            last_side: HashMap::new(),
        }
    }
}

impl SignalSource for CrossSignal {
    fn on_event(&mut self, event: &MarketEvent) -> Vec<IntentDraft> {
        let Some(prev) = self.ema.get(&event.symbol).copied() else {
            self.ema.insert(event.symbol.clone(), event.price);
            return Vec::new();
        };
        let ema = prev + self.alpha * (event.price - prev);
        self.ema.insert(event.symbol.clone(), ema);

        let side = if event.price > ema {
            Side::Buy
        } else if event.price < ema {
            Side::Sell
        } else {
            return Vec::new();
        };
        if self.last_side.insert(event.symbol.clone(), side) == Some(side) {
            return Vec::new();
        }
        let mut draft = IntentDraft::market(&event.symbol, side, self.qty, event.price);
        draft.meta.insert("ema".into(), format!("{:.6}", ema));
        vec![draft]
    }
}
