//! Property tests for the two stateful contracts everything else leans on.
//!
//! 1. Ledger fills: every fill lands in exactly one of the five transitions,
//!    the stored row agrees with a lot and cost-basis reference book, and
//!    flat means no row.
//! 2. mark_once: for any key sequence, every backend answers `true` exactly
//!    once per distinct key.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use pipelinefx::clock::SimClock;
use pipelinefx::events::Side;
use pipelinefx::idempotency::{FileIdempotencyStore, IdempotencyStore, SqliteIdempotencyStore, TtlIdempotencyStore};
use pipelinefx::ledger::{next_position, PositionLedger, Transition, EPSILON};
use pipelinefx::reliability::{JitterMode, RetryPolicy};

// ── Strategies ───────────────────────────────────────────────────────

fn arb_side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

/// Whole lots so closes land exactly on zero often enough to matter.
fn arb_fill() -> impl Strategy<Value = (Side, f64, f64)> {
    (arb_side(), 1u32..6, 50u32..150).prop_map(|(side, q, p)| (side, q as f64, p as f64))
}

fn arb_keys() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(0u8..12, 1..60).prop_map(|ks| ks.into_iter().map(|k| format!("exec:I-{}", k)).collect())
}

// ── 1. Ledger five-case transform ────────────────────────────────────

/// Reference book kept as signed lots plus total cost basis, so the average
/// is derived rather than carried.
#[derive(Debug, Default)]
struct Book {
    lots: f64,
    cost: f64,
    realized: f64,
}

impl Book {
    fn avg(&self) -> f64 {
        self.cost / self.lots.abs()
    }

    fn fill(&mut self, side: Side, qty: f64, price: f64) -> Transition {
        let d = match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        };
        if self.lots == 0.0 {
            self.lots = d;
            self.cost = qty * price;
            return Transition::Opened;
        }
        let long = self.lots > 0.0;
        if long == (d > 0.0) {
            self.lots += d;
            self.cost += qty * price;
            return Transition::Increased;
        }
        let held = self.lots.abs();
        let closed = qty.min(held);
        let per_lot = if long { price - self.avg() } else { self.avg() - price };
        self.realized += closed * per_lot;
        if qty < held {
            self.cost -= closed * self.avg();
            self.lots += d;
            Transition::Reduced
        } else if qty == held {
            self.lots = 0.0;
            self.cost = 0.0;
            Transition::Closed
        } else {
            self.lots += d;
            self.cost = self.lots.abs() * price;
            Transition::Reversed
        }
    }
}

proptest! {
    #[test]
    fn ledger_matches_reference_book(fills in prop::collection::vec(arb_fill(), 1..40)) {
        let ledger = PositionLedger::open_in_memory().unwrap();
        let mut book = Book::default();

        for (side, fill_qty, price) in fills {
            let want = book.fill(side, fill_qty, price);
            let outcome = ledger.apply_fill("BTCUSDT", side, fill_qty, price).unwrap();
            prop_assert_eq!(outcome.transition, want);

            let row = ledger.get_position("BTCUSDT").unwrap();
            if book.lots == 0.0 {
                prop_assert!(row.is_none());
            } else {
                let row = row.unwrap();
                prop_assert!((row.qty - book.lots).abs() < 1e-9);
                let stored_avg = row.avg_price.unwrap();
                prop_assert!(stored_avg > 0.0);
                prop_assert!((stored_avg - book.avg()).abs() < 1e-6);
                if matches!(want, Transition::Opened | Transition::Reversed) {
                    prop_assert_eq!(stored_avg, price);
                }
            }
        }
        prop_assert!((ledger.realized_pnl("BTCUSDT").unwrap() - book.realized).abs() < 1e-6);
    }

    #[test]
    fn pure_transition_agrees_with_ledger(fills in prop::collection::vec(arb_fill(), 1..20)) {
        let ledger = PositionLedger::open_in_memory().unwrap();
        let (mut qty, mut avg) = (0.0_f64, 0.0_f64);
        for (side, fill_qty, price) in fills {
            let change = next_position(qty, avg, side, fill_qty, price);
            let outcome = ledger.apply_fill("BTCUSDT", side, fill_qty, price).unwrap();
            prop_assert_eq!(outcome.transition, change.transition);
            prop_assert!((outcome.realized_pnl - change.realized_pnl).abs() < 1e-9);
            qty = change.qty;
            avg = change.avg_price.unwrap_or(0.0);
            prop_assert!(qty.abs() >= EPSILON || change.avg_price.is_none());
        }
    }

    #[test]
    fn round_trip_realizes_price_difference(q in 1u32..50, entry in 10u32..500, exit in 10u32..500) {
        let ledger = PositionLedger::open_in_memory().unwrap();
        let (q, entry, exit) = (q as f64, entry as f64, exit as f64);
        ledger.apply_fill("ETHUSDT", Side::Sell, q, entry).unwrap();
        let out = ledger.apply_fill("ETHUSDT", Side::Buy, q, exit).unwrap();
        prop_assert_eq!(out.transition, Transition::Closed);
        prop_assert!(ledger.get_position("ETHUSDT").unwrap().is_none());
        // short profits when price falls
        prop_assert!((out.realized_pnl - q * (entry - exit)).abs() < 1e-6);
    }
}

// ── 2. mark_once exactly once ────────────────────────────────────────

fn answers(store: &mut dyn IdempotencyStore, keys: &[String]) -> Vec<bool> {
    keys.iter().map(|k| store.mark_once(k).unwrap()).collect()
}

fn expected(keys: &[String]) -> Vec<bool> {
    let mut seen = HashSet::new();
    keys.iter().map(|k| seen.insert(k.clone())).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn mark_once_exactly_once_every_backend(keys in arb_keys()) {
        let clock = Arc::new(SimClock::new(1_000));
        let want = expected(&keys);

        let mut memory = TtlIdempotencyStore::new(Duration::from_secs(60), clock.clone());
        prop_assert_eq!(answers(&mut memory, &keys), want.clone());

        let dir = tempfile::tempdir().unwrap();
        let mut file = FileIdempotencyStore::open(dir.path().join("idem.log"), clock.clone()).unwrap();
        prop_assert_eq!(answers(&mut file, &keys), want.clone());

        let mut sqlite = SqliteIdempotencyStore::open_in_memory(clock).unwrap();
        prop_assert_eq!(answers(&mut sqlite, &keys), want);
    }

    #[test]
    fn file_log_remembers_across_reopen(keys in arb_keys()) {
        let clock = Arc::new(SimClock::new(0));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idem.log");
        let (head, tail) = keys.split_at(keys.len() / 2);
        {
            let mut store = FileIdempotencyStore::open(&path, clock.clone()).unwrap();
            answers(&mut store, head);
        }
        let mut reopened = FileIdempotencyStore::open(&path, clock).unwrap();
        let got = answers(&mut reopened, tail);
        prop_assert_eq!(got, expected(&keys)[head.len()..].to_vec());
    }

    #[test]
    fn retry_delay_bounded_and_deterministic(attempt in 0u32..12, key in "[a-z:0-9-]{1,24}") {
        let policy = RetryPolicy { jitter: JitterMode::Hash, ..RetryPolicy::default() };
        let d = policy.compute_delay(attempt, &key);
        prop_assert_eq!(d, policy.compute_delay(attempt, &key));
        let base = (policy.base_delay_ms as f64 * policy.multiplier.powi(attempt as i32)).min(policy.max_delay_ms as f64) as u64;
        prop_assert!(d >= base);
        prop_assert!(d < base + (base / 4).max(1));
    }
}
