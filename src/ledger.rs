//! Transactional position ledger: symbol → signed net position.
//!
//! The only durable state the pipeline mutates. Fills go through
//! [`PositionLedger::apply_fill`], which reads, computes and writes (or deletes)
//! inside one immediate SQLite transaction. A flat position has no row.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::events::{Meta, Side};
use crate::logging::{self, obj, v_num, v_str, Domain};

/// Quantities closer to zero than this are flat.
pub const EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid fill: {0}")]
    InvalidFill(String),
    #[error("invalid position: {0}")]
    InvalidPosition(String),
    #[error("corrupt row for {symbol}: {reason}")]
    CorruptRow { symbol: String, reason: String },
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("ledger db: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Positive = long, negative = short.
    pub qty: f64,
    /// Defined only while `qty != 0`.
    pub avg_price: Option<f64>,
    pub updated_at: String,
    pub meta: Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Was flat; fill opens a position at the fill price.
    Opened,
    /// Fill brings the position to exactly flat; row deleted.
    Closed,
    /// Crossed through zero; cost basis resets to the fill price.
    Reversed,
    /// Same direction, larger; weighted average cost.
    Increased,
    /// Same direction, smaller; average cost unchanged.
    Reduced,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Opened => "opened",
            Transition::Closed => "closed",
            Transition::Reversed => "reversed",
            Transition::Increased => "increased",
            Transition::Reduced => "reduced",
        }
    }
}

/// Result of applying one fill to a `(qty, avg_price)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionChange {
    pub qty: f64,
    pub avg_price: Option<f64>,
    pub transition: Transition,
    pub realized_pnl: f64,
}

/// Pure fill arithmetic. `avg_price` is ignored when `qty` is flat.
pub fn next_position(qty: f64, avg_price: f64, side: Side, fill_qty: f64, price: f64) -> PositionChange {
    let delta = side.sign() * fill_qty;
    let new_qty = qty + delta;

    if qty.abs() < EPSILON {
        return PositionChange {
            qty: delta,
            avg_price: Some(price),
            transition: Transition::Opened,
            realized_pnl: 0.0,
        };
    }

    let direction = qty.signum();
    if new_qty.abs() < EPSILON {
        return PositionChange {
            qty: 0.0,
            avg_price: None,
            transition: Transition::Closed,
            realized_pnl: qty.abs() * (price - avg_price) * direction,
        };
    }
    if new_qty.signum() != direction {
        return PositionChange {
            qty: new_qty,
            avg_price: Some(price),
            transition: Transition::Reversed,
            realized_pnl: qty.abs() * (price - avg_price) * direction,
        };
    }
    if new_qty.abs() > qty.abs() {
        let avg = (qty.abs() * avg_price + fill_qty * price) / new_qty.abs();
        return PositionChange {
            qty: new_qty,
            avg_price: Some(avg),
            transition: Transition::Increased,
            realized_pnl: 0.0,
        };
    }
    PositionChange {
        qty: new_qty,
        avg_price: Some(avg_price),
        transition: Transition::Reduced,
        realized_pnl: fill_qty * (price - avg_price) * direction,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    /// `None` when the fill closed the position.
    pub position: Option<Position>,
    pub transition: Transition,
    pub realized_pnl: f64,
}

pub struct PositionLedger {
    conn: Mutex<Connection>,
}

impl PositionLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY NOT NULL,
                qty REAL NOT NULL,
                avg_price REAL,
                updated_at TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            );
            CREATE TABLE IF NOT EXISTS realized_pnl (
                symbol TEXT PRIMARY KEY NOT NULL,
                amount REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_meta (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Apply one fill atomically. Inputs are validated before any read.
    pub fn apply_fill(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<FillOutcome, LedgerError> {
        validate_fill(symbol, qty, price)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = read_position(&tx, symbol)?;
        let (cur_qty, cur_avg, meta) = match &current {
            Some(p) => (p.qty, p.avg_price.unwrap_or(0.0), p.meta.clone()),
            None => (0.0, 0.0, Meta::new()),
        };
        let change = next_position(cur_qty, cur_avg, side, qty, price);

        let position = if change.transition == Transition::Closed {
            tx.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
            None
        } else {
            let pos = Position {
                symbol: symbol.to_string(),
                qty: change.qty,
                avg_price: change.avg_price,
                updated_at: logging::ts_now(),
                meta,
            };
            write_position(&tx, &pos)?;
            Some(pos)
        };

        if change.realized_pnl != 0.0 {
            tx.execute(
                "INSERT INTO realized_pnl (symbol, amount) VALUES (?1, ?2)
                 ON CONFLICT(symbol) DO UPDATE SET amount = amount + excluded.amount",
                params![symbol, change.realized_pnl],
            )?;
        }
        tx.commit()?;

        logging::info(
            Domain::Position,
            "fill_applied",
            obj(&[
                ("symbol", v_str(symbol)),
                ("side", v_str(side.as_str())),
                ("qty", v_num(qty)),
                ("price", v_num(price)),
                ("transition", v_str(change.transition.as_str())),
                ("new_qty", v_num(change.qty)),
                ("realized_pnl", v_num(change.realized_pnl)),
            ]),
        );

        Ok(FillOutcome {
            position,
            transition: change.transition,
            realized_pnl: change.realized_pnl,
        })
    }

    pub fn get_position(&self, symbol: &str) -> Result<Option<Position>, LedgerError> {
        let conn = self.lock()?;
        read_position(&conn, symbol)
    }

    pub fn list_positions(&self) -> Result<Vec<Position>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, qty, avg_price, updated_at, meta FROM positions ORDER BY symbol",
        )?;
        let rows = stmt.query_map([], raw_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_row(row?)?);
        }
        Ok(out)
    }

    /// Returns whether a row was removed.
    pub fn delete_position(&self, symbol: &str) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])? > 0)
    }

    /// Direct overwrite for initialisation and tests. Never used on the fill path.
    pub fn upsert_position(&self, position: &Position) -> Result<(), LedgerError> {
        if position.symbol.trim().is_empty() {
            return Err(LedgerError::InvalidPosition("empty symbol".into()));
        }
        if !position.qty.is_finite() {
            return Err(LedgerError::InvalidPosition(format!("qty {}", position.qty)));
        }
        let conn = self.lock()?;
        if position.qty.abs() < EPSILON {
            conn.execute("DELETE FROM positions WHERE symbol = ?1", params![position.symbol])?;
            return Ok(());
        }
        match position.avg_price {
            Some(p) if p.is_finite() && p > 0.0 => write_position(&conn, position),
            other => Err(LedgerError::InvalidPosition(format!(
                "{} has qty {} but avg_price {:?}",
                position.symbol, position.qty, other
            ))),
        }
    }

    pub fn realized_pnl(&self, symbol: &str) -> Result<f64, LedgerError> {
        let conn = self.lock()?;
        let amount: Option<f64> = conn
            .query_row("SELECT amount FROM realized_pnl WHERE symbol = ?1", params![symbol], |r| r.get(0))
            .optional()?;
        Ok(amount.unwrap_or(0.0))
    }

    pub fn total_realized_pnl(&self) -> Result<f64, LedgerError> {
        let conn = self.lock()?;
        let total: Option<f64> = conn.query_row("SELECT SUM(amount) FROM realized_pnl", [], |r| r.get(0))?;
        Ok(total.unwrap_or(0.0))
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO run_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row("SELECT value FROM run_meta WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    /// SHA-256 over (symbol, qty, avg_price) of every open position plus
    /// realized PnL. Wall-clock fields are excluded so two runs that did the
    /// same work hash the same.
    pub fn state_hash(&self) -> Result<String, LedgerError> {
        let mut hasher = Sha256::new();
        for p in self.list_positions()? {
            hasher.update(p.symbol.as_bytes());
            hasher.update(quantize(p.qty).to_be_bytes());
            hasher.update(quantize(p.avg_price.unwrap_or(0.0)).to_be_bytes());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT symbol, amount FROM realized_pnl ORDER BY symbol")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?;
        for row in rows {
            let (symbol, amount) = row?;
            hasher.update(symbol.as_bytes());
            hasher.update(quantize(amount).to_be_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

fn quantize(x: f64) -> i64 {
    (x * 1e8).round() as i64
}

fn validate_fill(symbol: &str, qty: f64, price: f64) -> Result<(), LedgerError> {
    if symbol.trim().is_empty() {
        return Err(LedgerError::InvalidFill("empty symbol".into()));
    }
    if !qty.is_finite() || qty <= 0.0 {
        return Err(LedgerError::InvalidFill(format!("qty must be > 0, got {}", qty)));
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(LedgerError::InvalidFill(format!("price must be > 0, got {}", price)));
    }
    Ok(())
}

type RawRow = (String, f64, Option<f64>, String, String);

fn raw_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
}

fn decode_row((symbol, qty, avg_price, updated_at, meta): RawRow) -> Result<Position, LedgerError> {
    let meta: Meta = serde_json::from_str(&meta).map_err(|e| LedgerError::CorruptRow {
        symbol: symbol.clone(),
        reason: format!("meta: {}", e),
    })?;
    if qty.abs() >= EPSILON && avg_price.is_none() {
        return Err(LedgerError::CorruptRow {
            symbol,
            reason: "open position without avg_price".into(),
        });
    }
    Ok(Position { symbol, qty, avg_price, updated_at, meta })
}

fn read_position(conn: &Connection, symbol: &str) -> Result<Option<Position>, LedgerError> {
    let raw = conn
        .query_row(
            "SELECT symbol, qty, avg_price, updated_at, meta FROM positions WHERE symbol = ?1",
            params![symbol],
            raw_row,
        )
        .optional()?;
    raw.map(decode_row).transpose()
}

fn write_position(conn: &Connection, p: &Position) -> Result<(), LedgerError> {
    let meta = serde_json::to_string(&p.meta).map_err(|e| LedgerError::InvalidPosition(e.to_string()))?;
    conn.execute(
        "INSERT INTO positions (symbol, qty, avg_price, updated_at, meta) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(symbol) DO UPDATE SET
            qty = excluded.qty,
            avg_price = excluded.avg_price,
            updated_at = excluded.updated_at,
            meta = excluded.meta",
        params![p.symbol, p.qty, p.avg_price, p.updated_at, meta],
    )?;
    Ok(())
}
