//! Print the persisted state of a run: checkpoint, open positions, realized
//! PnL and the ledger state hash.
//!
//! Usage: inspect [DATA_DIR]   (defaults to $DATA_DIR, then ./data)

use std::path::PathBuf;

use anyhow::{Context, Result};
use pipelinefx::config::{CHECKPOINT_FILE, LEDGER_FILE};
use pipelinefx::ledger::PositionLedger;
use pipelinefx::reliability::{Checkpoint, CheckpointError};
use serde_json::json;

fn main() -> Result<()> {
    let dir = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DATA_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./data"));

    let checkpoint = match Checkpoint::load(&dir.join(CHECKPOINT_FILE)) {
        Ok(cp) => Some(cp),
        Err(CheckpointError::NotFound(_)) => None,
        Err(e) => return Err(e).context("reading checkpoint"),
    };

    let ledger_path = dir.join(LEDGER_FILE);
    let ledger = if ledger_path.exists() {
        let ledger = PositionLedger::open(&ledger_path).context("opening ledger")?;
        let positions = ledger.list_positions()?;
        json!({
            "run_id": ledger.get_meta("run_id")?,
            "exec_mode": ledger.get_meta("exec_mode")?,
            "positions": positions,
            "total_realized_pnl": ledger.total_realized_pnl()?,
            "state_hash": ledger.state_hash()?,
        })
    } else {
        serde_json::Value::Null
    };

    let out = json!({
        "data_dir": dir.display().to_string(),
        "checkpoint": checkpoint,
        "ledger": ledger,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
