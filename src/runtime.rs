//! Wires a [`Config`] into a runnable orchestrator backed by files under
//! `DATA_DIR`.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::adapter::{CrossSignal, FlakyExchange, PaperExchange, SyntheticMarketData};
use crate::clock::SimClock;
use crate::config::{Config, ExecMode};
use crate::idempotency::open_store;
use crate::ledger::PositionLedger;
use crate::logging::{self, obj, v_int, v_str, Domain};
use crate::orchestrator::{Orchestrator, StopSignal};
use crate::reliability::{retry, Checkpoint};
use crate::workers::{ExecWorker, IntentCache, PositionWorker, RiskWorker};

/// Synthetic stream start: 2023-11-14T22:13:20Z.
pub const SIM_START_MS: u64 = 1_700_000_000_000;
pub const SIM_STEP_MS: u64 = 60_000;
pub const SIGNAL_PERIOD: u32 = 20;
pub const SIGNAL_QTY: f64 = 1.0;

pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub ledger: Arc<PositionLedger>,
}

/// Load the checkpoint to resume from, or start fresh when `RESUME` is unset.
/// Under `RESUME` a missing or unreadable checkpoint is an error.
pub fn initial_checkpoint(cfg: &Config) -> Result<Checkpoint> {
    let path = cfg.checkpoint_path();
    if !cfg.resume {
        if path.exists() {
            logging::warn(
                Domain::Checkpoint,
                "existing_checkpoint_ignored",
                obj(&[("path", v_str(&path.display().to_string()))]),
            );
        }
        return Ok(Checkpoint::create_new(&cfg.run_id));
    }
    match Checkpoint::load(&path) {
        Ok(cp) => {
            if cp.run_id != cfg.run_id {
                bail!("checkpoint at {} belongs to run {}, not {}", path.display(), cp.run_id, cfg.run_id);
            }
            logging::info(
                Domain::Checkpoint,
                "loaded",
                obj(&[
                    ("run_id", v_str(&cp.run_id)),
                    ("last_processed_idx", serde_json::json!(cp.last_processed_idx)),
                    ("processed_count", v_int(cp.processed_count)),
                ]),
            );
            Ok(cp)
        }
        Err(e) => Err(e).with_context(|| format!("RESUME is set but the checkpoint at {} could not be loaded", path.display())),
    }
}

pub fn build(cfg: &Config, stop: StopSignal) -> Result<Runtime> {
    cfg.validate()?;
    if cfg.exec_mode == ExecMode::Live {
        bail!("EXEC_MODE=live: no live venue adapter is available; use sim or paper");
    }

    fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;

    let clock = SimClock::new(SIM_START_MS);
    let store = open_store(cfg.idempotency_backend, &cfg.data_dir, cfg.idempotency_ttl, Arc::new(clock.clone()))
        .context("opening idempotency store")?;
    let ledger = Arc::new(PositionLedger::open(cfg.ledger_path()).context("opening position ledger")?);
    ledger.set_meta("run_id", &cfg.run_id)?;
    ledger.set_meta("exec_mode", cfg.exec_mode.as_str())?;

    let checkpoint = initial_checkpoint(cfg)?;
    let intents = IntentCache::new();

    let venue = PaperExchange { fee_bps: cfg.fee_bps, slippage_bps: cfg.slippage_bps };
    let mut exec = ExecWorker::new(
        Box::new(FlakyExchange::new(venue, cfg.fault_plan())),
        store,
        intents.clone(),
        cfg.retry_policy(),
        Arc::new(clock.clone()),
    );
    exec = match cfg.exec_mode {
        ExecMode::Paper => exec.with_sleeper(Box::new(retry::thread_sleep)),
        _ => exec.with_sleeper(Box::new(|_: Duration| {})),
    };

    let market = SyntheticMarketData::new(
        cfg.symbols.clone(),
        cfg.seed,
        SIM_START_MS,
        SIM_STEP_MS,
        cfg.ticks * cfg.symbols.len(),
    );
    let orchestrator = Orchestrator::builder(Box::new(market), Box::new(CrossSignal::new(SIGNAL_PERIOD, SIGNAL_QTY)))
        .config(cfg.orchestrator_config())
        .run_id(&cfg.run_id)
        .clock(clock)
        .intent_cache(intents)
        .stop_signal(stop)
        .checkpoint_path(cfg.checkpoint_path())
        .resume_from(checkpoint)
        .worker(Box::new(RiskWorker::new(Box::new(cfg.risk_limits())).with_ledger(ledger.clone())))
        .worker(Box::new(exec))
        .worker(Box::new(PositionWorker::new(ledger.clone())))
        .build()?;

    logging::info(
        Domain::System,
        "runtime_ready",
        obj(&[
            ("run_id", v_str(&cfg.run_id)),
            ("exec_mode", v_str(cfg.exec_mode.as_str())),
            ("idempotency_backend", v_str(cfg.idempotency_backend.as_str())),
            ("data_dir", v_str(&cfg.data_dir.display().to_string())),
        ]),
    );
    Ok(Runtime { orchestrator, ledger })
}
