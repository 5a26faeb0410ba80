use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::events::MarketEvent;

pub trait MarketDataAdapter: Send {
    /// Up to `max_items` events with `ts <= up_to_ts`, in order. Empty once
    /// the stream is exhausted, and on every call after that.
    fn poll(&mut self, max_items: usize, up_to_ts: u64) -> Vec<MarketEvent>;

    /// Timestamp of the next event, or `None` when exhausted.
    fn peek_next_ts(&self) -> Option<u64>;
}

/// Replays a fixed list of events, sorted by timestamp on construction
/// (stable, so equal timestamps keep their given order).
#[derive(Debug, Clone, Default)]
pub struct VecMarketData {
    events: VecDeque<MarketEvent>,
}

impl VecMarketData {
    pub fn new(mut events: Vec<MarketEvent>) -> Self {
        events.sort_by_key(|e| e.ts);
        Self { events: events.into() }
    }

    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl MarketDataAdapter for VecMarketData {
    fn poll(&mut self, max_items: usize, up_to_ts: u64) -> Vec<MarketEvent> {
        let mut out = Vec::new();
        while out.len() < max_items {
            if !matches!(self.events.front(), Some(e) if e.ts <= up_to_ts) {
                break;
            }
            out.extend(self.events.pop_front());
        }
        out
    }

    fn peek_next_ts(&self) -> Option<u64> {
        self.events.front().map(|e| e.ts)
    }
}

/// Seeded random walk over a set of symbols. One event per symbol per tick;
/// the same seed always yields the same stream.
pub struct SyntheticMarketData {
    symbols: Vec<String>,
    rng: StdRng,
    prices: HashMap<String, f64>,
    start_ts: u64,
    step_ms: u64,
    total: usize,
    emitted: usize,
    volatility: f64,
    next: Option<MarketEvent>,
}

impl SyntheticMarketData {
    pub fn new(symbols: Vec<String>, seed: u64, start_ts: u64, step_ms: u64, total: usize) -> Self {
        let prices = symbols.iter().map(|s| (s.clone(), 100.0)).collect();
        let mut feed = Self {
            symbols,
            rng: StdRng::seed_from_u64(seed),
            prices,
            start_ts,
            step_ms: step_ms.max(1),
            total,
            emitted: 0,
            volatility: 0.01,
            next: None,
        };
        feed.next = feed.generate();
        feed
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility.abs();
        self
    }

    fn generate(&mut self) -> Option<MarketEvent> {
        if self.emitted >= self.total || self.symbols.is_empty() {
            return None;
        }
        let i = self.emitted;
        self.emitted += 1;
        let symbol = self.symbols[i % self.symbols.len()].clone();
        let tick = (i / self.symbols.len()) as u64;
        let shock: f64 = if self.volatility > 0.0 {
            self.rng.gen_range(-self.volatility..self.volatility)
        } else {
            0.0
        };
        let volume: f64 = self.rng.gen_range(1.0..10.0);
        let price = self.prices.entry(symbol.clone()).or_insert(100.0);
        *price = (*price * (1.0 + shock)).max(0.01);
        Some(MarketEvent {
            event_id: format!("M-{}-{}", symbol, i),
            ts: self.start_ts + tick * self.step_ms,
            symbol,
            price: *price,
            volume,
        })
    }
}

impl MarketDataAdapter for SyntheticMarketData {
    fn poll(&mut self, max_items: usize, up_to_ts: u64) -> Vec<MarketEvent> {
        let mut out = Vec::new();
        while out.len() < max_items {
            if !matches!(&self.next, Some(e) if e.ts <= up_to_ts) {
                break;
            }
            let next = self.generate();
            out.extend(std::mem::replace(&mut self.next, next));
        }
        out
    }

    fn peek_next_ts(&self) -> Option<u64> {
        self.next.as_ref().map(|e| e.ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(id: &str, ts: u64) -> MarketEvent {
        MarketEvent { event_id: id.into(), ts, symbol: "X".into(), price: 1.0, volume: 1.0 }
    }

    #[test]
    fn test_vec_respects_up_to_ts() {
        let mut feed = VecMarketData::new(vec![ev("b", 20), ev("a", 10), ev("c", 20)]);
        assert_eq!(feed.peek_next_ts(), Some(10));
        let got = feed.poll(10, 15);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event_id, "a");
        let got = feed.poll(1, 20);
        assert_eq!(got[0].event_id, "b");
        assert_eq!(feed.poll(5, 100)[0].event_id, "c");
    }

    #[test]
    fn test_exhausted_keeps_returning_empty() {
        let mut feed = VecMarketData::new(vec![ev("a", 1)]);
        assert_eq!(feed.poll(5, 10).len(), 1);
        for _ in 0..3 {
            assert!(feed.poll(5, u64::MAX).is_empty());
            assert_eq!(feed.peek_next_ts(), None);
        }
    }

    #[test]
    fn test_synthetic_is_seeded() {
        let collect = |seed| {
            let mut feed = SyntheticMarketData::new(vec!["A".into(), "B".into()], seed, 1_000, 60_000, 20);
            feed.poll(100, u64::MAX)
        };
        let a = collect(7);
        assert_eq!(a.len(), 20);
        assert_eq!(a, collect(7));
        assert_ne!(a, collect(8));
    }

    #[test]
    fn test_synthetic_timestamps_per_tick() {
        let mut feed = SyntheticMarketData::new(vec!["A".into(), "B".into()], 1, 1_000, 500, 5);
        let ts: Vec<u64> = feed.poll(10, u64::MAX).iter().map(|e| e.ts).collect();
        assert_eq!(ts, vec![1_000, 1_000, 1_500, 1_500, 2_000]);
        assert!(feed.poll(10, u64::MAX).is_empty());
    }
}
