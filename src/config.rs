//! Runtime configuration read from the environment.
//!
//! Numeric knobs fall back to their defaults when unset or unparsable. Enum
//! knobs (mode, backend, jitter) are rejected when unrecognized, and live mode
//! refuses to start without exchange credentials.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::adapter::LimitRiskEvaluator;
use crate::fault::FaultPlan;
use crate::idempotency::IdempotencyBackend;
use crate::orchestrator::OrchestratorConfig;
use crate::reliability::{JitterMode, RetryPolicy};

pub const API_KEY_VAR: &str = "EXCHANGE_API_KEY";
pub const API_SECRET_VAR: &str = "EXCHANGE_API_SECRET";

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LEDGER_FILE: &str = "ledger.sqlite";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Carries the variable name only, never its value.
    #[error("missing credential: set {0}")]
    MissingCredential(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Simulated venue with injected faults; backoff does not sleep.
    Sim,
    /// Simulated venue, real backoff sleeps.
    Paper,
    Live,
}

impl ExecMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" => Some(ExecMode::Sim),
            "paper" => Some(ExecMode::Paper),
            "live" => Some(ExecMode::Live),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Sim => "sim",
            ExecMode::Paper => "paper",
            ExecMode::Live => "live",
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub run_id: String,
    pub data_dir: PathBuf,
    pub exec_mode: ExecMode,
    pub idempotency_backend: IdempotencyBackend,
    pub idempotency_ttl: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_multiplier: f64,
    pub retry_jitter: JitterMode,
    pub max_drain_iters: usize,
    pub step_batch: usize,
    /// `None` runs until the market stream is exhausted.
    pub steps: Option<usize>,
    /// Synthetic stream length in ticks.
    pub ticks: usize,
    pub symbols: Vec<String>,
    pub seed: u64,
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub max_order_qty: f64,
    pub max_notional: f64,
    pub resume: bool,
    /// Roughly one submission attempt in N times out (sim mode); 0 disables.
    pub fault_every: u64,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

// Credentials never reach Debug output.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| if v.is_some() { "[REDACTED]" } else { "<unset>" };
        f.debug_struct("Config")
            .field("run_id", &self.run_id)
            .field("data_dir", &self.data_dir)
            .field("exec_mode", &self.exec_mode)
            .field("idempotency_backend", &self.idempotency_backend)
            .field("idempotency_ttl", &self.idempotency_ttl)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("retry_max_ms", &self.retry_max_ms)
            .field("retry_multiplier", &self.retry_multiplier)
            .field("retry_jitter", &self.retry_jitter)
            .field("max_drain_iters", &self.max_drain_iters)
            .field("step_batch", &self.step_batch)
            .field("steps", &self.steps)
            .field("ticks", &self.ticks)
            .field("symbols", &self.symbols)
            .field("seed", &self.seed)
            .field("fee_bps", &self.fee_bps)
            .field("slippage_bps", &self.slippage_bps)
            .field("max_order_qty", &self.max_order_qty)
            .field("max_notional", &self.max_notional)
            .field("resume", &self.resume)
            .field("fault_every", &self.fault_every)
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &redact(&self.api_secret))
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |k: &str| get(k).and_then(|v| v.trim().parse::<f64>().ok());
        let int = |k: &str| get(k).and_then(|v| v.trim().parse::<u64>().ok());

        let exec_mode = match get("EXEC_MODE") {
            Some(v) => ExecMode::parse(&v).ok_or(ConfigError::Invalid { var: "EXEC_MODE", value: v })?,
            None => ExecMode::Sim,
        };
        let idempotency_backend = match get("IDEMPOTENCY_BACKEND") {
            Some(v) => IdempotencyBackend::parse(&v).ok_or(ConfigError::Invalid { var: "IDEMPOTENCY_BACKEND", value: v })?,
            None => IdempotencyBackend::Sqlite,
        };
        let retry_jitter = match get("RETRY_JITTER") {
            Some(v) => JitterMode::parse(&v).ok_or(ConfigError::Invalid { var: "RETRY_JITTER", value: v })?,
            None => JitterMode::Hash,
        };
        let symbols: Vec<String> = get("SYMBOLS")
            .unwrap_or_else(|| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        let resume = get("RESUME")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let cfg = Config {
            run_id: get("RUN_ID").unwrap_or_else(|| "sim-run".to_string()),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".to_string())),
            exec_mode,
            idempotency_backend,
            idempotency_ttl: Duration::from_secs(int("IDEMPOTENCY_TTL_SECS").unwrap_or(86_400)),
            retry_max_attempts: int("RETRY_MAX_ATTEMPTS").and_then(|n| u32::try_from(n).ok()).unwrap_or(5),
            retry_base_ms: int("RETRY_BASE_MS").unwrap_or(100),
            retry_max_ms: int("RETRY_MAX_MS").unwrap_or(5_000),
            retry_multiplier: num("RETRY_MULTIPLIER").filter(|m| *m >= 1.0).unwrap_or(2.0),
            retry_jitter,
            max_drain_iters: int("MAX_DRAIN_ITERS").unwrap_or(10_000) as usize,
            step_batch: int("STEP_BATCH").filter(|n| *n > 0).unwrap_or(64) as usize,
            steps: int("STEPS").map(|n| n as usize),
            ticks: int("TICKS").unwrap_or(500) as usize,
            symbols: if symbols.is_empty() { vec!["BTCUSDT".to_string()] } else { symbols },
            seed: int("SEED").unwrap_or(42),
            fee_bps: num("FEE_BPS").unwrap_or(1.0),
            slippage_bps: num("SLIPPAGE_BPS").unwrap_or(2.0),
            max_order_qty: num("MAX_ORDER_QTY").unwrap_or(10.0),
            max_notional: num("MAX_NOTIONAL").unwrap_or(1_000_000.0),
            resume,
            fault_every: int("FAULT_EVERY").unwrap_or(0),
            api_key: get(API_KEY_VAR).filter(|v| !v.is_empty()),
            api_secret: get(API_SECRET_VAR).filter(|v| !v.is_empty()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Live mode needs both exchange credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exec_mode == ExecMode::Live {
            if self.api_key.is_none() {
                return Err(ConfigError::MissingCredential(API_KEY_VAR));
            }
            if self.api_secret.is_none() {
                return Err(ConfigError::MissingCredential(API_SECRET_VAR));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay_ms: self.retry_base_ms,
            max_delay_ms: self.retry_max_ms,
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_drain_iterations: self.max_drain_iters,
            worker_batch: self.step_batch,
            poll_batch: 1,
        }
    }

    pub fn risk_limits(&self) -> LimitRiskEvaluator {
        LimitRiskEvaluator {
            max_order_qty: self.max_order_qty,
            max_notional: self.max_notional,
            allowed_symbols: Some(self.symbols.iter().cloned().collect()),
            ..LimitRiskEvaluator::default()
        }
    }

    pub fn fault_plan(&self) -> FaultPlan {
        if self.exec_mode != ExecMode::Sim || self.fault_every == 0 {
            return FaultPlan::disabled();
        }
        FaultPlan::new(0, 1.0 / self.fault_every as f64, self.seed)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }
}
