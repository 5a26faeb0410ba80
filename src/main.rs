use anyhow::{Context, Result};
use pipelinefx::config::Config;
use pipelinefx::logging::{self, obj, v_int, v_str, Domain};
use pipelinefx::orchestrator::StopSignal;
use pipelinefx::runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env()?;
    logging::info(
        Domain::System,
        "startup",
        obj(&[
            ("run_id", v_str(&cfg.run_id)),
            ("exec_mode", v_str(cfg.exec_mode.as_str())),
            ("symbols", serde_json::json!(cfg.symbols)),
            ("seed", v_int(cfg.seed)),
            ("resume", serde_json::json!(cfg.resume)),
        ]),
    );

    let stop = StopSignal::new();
    let on_ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logging::warn(Domain::System, "ctrl_c", obj(&[("msg", v_str("stopping after current step"))]));
            on_ctrl_c.stop();
        }
    });

    let steps = cfg.steps;
    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut rt = runtime::build(&cfg, stop)?;
        let report = rt.orchestrator.run(steps)?;
        let hash = rt.ledger.state_hash()?;
        Ok((report, hash))
    })
    .await
    .context("pipeline task panicked")??;

    let (report, state_hash) = report;
    logging::info(
        Domain::System,
        "shutdown",
        obj(&[("state_hash", v_str(&state_hash)), ("stopped", serde_json::json!(report.stopped))]),
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
