//! Collaborator interfaces the pipeline depends on, one method each, plus the
//! simulated implementations the runnable binary wires in.

pub mod exchange;
pub mod market;
pub mod risk;
pub mod signal;

pub use exchange::{ExchangeAdapter, ExecError, FlakyExchange, PaperExchange};
pub use market::{MarketDataAdapter, SyntheticMarketData, VecMarketData};
pub use risk::{AllowAll, LimitRiskEvaluator, PortfolioContext, RiskError, RiskEvaluator, RiskVerdict};
pub use signal::{CrossSignal, IntentDraft, SignalSource};
