use std::collections::BTreeSet;

use crate::events::OrderIntent;

/// What the risk collaborator sees about the book when scoring an intent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioContext {
    pub position_qty: f64,
    pub avg_price: Option<f64>,
    pub open_positions: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskVerdict {
    pub allowed: bool,
    pub reasons: Vec<String>,
}

impl RiskVerdict {
    pub fn allow() -> Self {
        Self { allowed: true, reasons: Vec::new() }
    }

    pub fn deny(reasons: Vec<String>) -> Self {
        Self { allowed: false, reasons }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RiskError {
    #[error("risk engine unavailable: {0}")]
    Unavailable(String),
    #[error("cannot score intent: {0}")]
    Unscorable(String),
}

pub trait RiskEvaluator: Send {
    fn evaluate(&self, intent: &OrderIntent, ctx: &PortfolioContext) -> Result<RiskVerdict, RiskError>;
}

pub struct AllowAll;

impl RiskEvaluator for AllowAll {
    fn evaluate(&self, _intent: &OrderIntent, _ctx: &PortfolioContext) -> Result<RiskVerdict, RiskError> {
        Ok(RiskVerdict::allow())
    }
}

/// Static limits: order size, order notional, resulting position size and a
/// symbol allow-list. Every breached limit is reported, not just the first.
#[derive(Debug, Clone)]
pub struct LimitRiskEvaluator {
    pub max_order_qty: f64,
    pub max_notional: f64,
    pub max_abs_position: f64,
    pub allowed_symbols: Option<BTreeSet<String>>,
}

impl Default for LimitRiskEvaluator {
    fn default() -> Self {
        Self {
            max_order_qty: 100.0,
            max_notional: 1_000_000.0,
            max_abs_position: 1_000.0,
            allowed_symbols: None,
        }
    }
}

impl RiskEvaluator for LimitRiskEvaluator {
    fn evaluate(&self, intent: &OrderIntent, ctx: &PortfolioContext) -> Result<RiskVerdict, RiskError> {
        let price = intent
            .resolve_price()
            .ok_or_else(|| RiskError::Unscorable(format!("{} has no usable price", intent.event_id)))?;

        let mut reasons = Vec::new();
        if let Some(allowed) = &self.allowed_symbols {
            if !allowed.contains(&intent.symbol) {
                reasons.push(format!("symbol_not_allowed:{}", intent.symbol));
            }
        }
        if intent.qty > self.max_order_qty {
            reasons.push(format!("max_order_qty:{}>{}", intent.qty, self.max_order_qty));
        }
        let notional = intent.qty * price;
        if notional > self.max_notional {
            reasons.push(format!("max_notional:{:.2}>{:.2}", notional, self.max_notional));
        }
        let resulting = ctx.position_qty + intent.side.sign() * intent.qty;
        // reducing exposure is always allowed
        if resulting.abs() > self.max_abs_position && resulting.abs() > ctx.position_qty.abs() {
            reasons.push(format!("max_abs_position:{}>{}", resulting.abs(), self.max_abs_position));
        }

        if reasons.is_empty() {
            Ok(RiskVerdict::allow())
        } else {
            Ok(RiskVerdict::deny(reasons))
        }
    }
}
