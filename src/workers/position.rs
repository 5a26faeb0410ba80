use std::sync::Arc;

use super::{unexpected, Worker, WorkerError, WorkerStats};
use crate::bus::EventBus;
use crate::events::{topics, ExecutionReport, Payload};
use crate::ledger::PositionLedger;
use crate::logging::{self, obj, v_str, Domain};

/// Terminal stage: fills in, ledger mutations out. Publishes nothing.
pub struct PositionWorker {
    ledger: Arc<PositionLedger>,
    stats: WorkerStats,
}

impl PositionWorker {
    pub fn new(ledger: Arc<PositionLedger>) -> Self {
        Self { ledger, stats: WorkerStats::default() }
    }

    fn apply(&mut self, report: &ExecutionReport) -> Result<(), WorkerError> {
        if !report.status.is_fill() || report.filled_qty <= 0.0 {
            self.stats.ignored += 1;
            logging::debug(
                Domain::Position,
                "report_ignored",
                obj(&[
                    ("trace_id", v_str(&report.trace_id)),
                    ("event_id", v_str(&report.event_id)),
                    ("status", serde_json::json!(report.status)),
                ]),
            );
            return Ok(());
        }
        let price = report
            .avg_price
            .ok_or_else(|| WorkerError::MissingPrice { event_id: report.event_id.clone() })?;
        self.ledger.apply_fill(&report.symbol, report.side, report.filled_qty, price)?;
        self.stats.fills_applied += 1;
        Ok(())
    }
}

impl Worker for PositionWorker {
    fn name(&self) -> &'static str {
        "position"
    }

    fn topic(&self) -> &str {
        topics::EXECUTION_REPORTS
    }

    fn step(&mut self, bus: &mut EventBus, max_items: usize) -> Result<usize, WorkerError> {
        let batch = bus.poll(topics::EXECUTION_REPORTS, max_items);
        for env in &batch {
            let Payload::Report(report) = &env.payload else {
                return Err(unexpected(env));
            };
            self.stats.consumed += 1;
            self.apply(report)?;
        }
        Ok(batch.len())
    }

    fn stats(&self) -> WorkerStats {
        self.stats
    }
}
