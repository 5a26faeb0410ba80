use super::{Worker, WorkerError, WorkerStats};
use crate::bus::EventBus;

/// Consumes and discards a topic that has no real downstream stage, so the
/// drain loop can still empty it.
pub struct DrainWorker {
    topic: String,
    stats: WorkerStats,
}

impl DrainWorker {
    pub fn new(topic: &str) -> Self {
        Self { topic: topic.to_string(), stats: WorkerStats::default() }
    }
}

impl Worker for DrainWorker {
    fn name(&self) -> &'static str {
        "drain"
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn step(&mut self, bus: &mut EventBus, max_items: usize) -> Result<usize, WorkerError> {
        let n = bus.poll(&self.topic, max_items).len();
        self.stats.consumed += n as u64;
        self.stats.ignored += n as u64;
        Ok(n)
    }

    fn stats(&self) -> WorkerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Payload, RiskDecision};

    #[test]
    fn test_discards_everything() {
        let mut bus = EventBus::new();
        for i in 0..5 {
            bus.publish("t", "decision", "T", Payload::Decision(RiskDecision {
                event_id: format!("D-{}", i),
                trace_id: "T".into(),
                ref_intent_event_id: "I".into(),
                ts: 0,
                allowed: true,
                reasons: vec![],
            }));
        }
        let mut w = DrainWorker::new("t");
        assert_eq!(w.step(&mut bus, 3).unwrap(), 3);
        assert_eq!(w.step(&mut bus, 3).unwrap(), 2);
        assert_eq!(w.step(&mut bus, 3).unwrap(), 0);
        assert_eq!(w.stats().ignored, 5);
    }
}
