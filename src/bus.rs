//! In-process publish/subscribe bus.
//!
//! Topics are FIFO queues created lazily on first publish or poll. Sequence
//! numbers are unique per bus and strictly increasing across all topics.

use std::collections::{BTreeMap, VecDeque};

use crate::events::{Envelope, Payload};
use crate::logging::{self, obj, v_int, v_str, Domain};

#[derive(Debug, Default)]
pub struct EventBus {
    topics: BTreeMap<String, VecDeque<Envelope>>,
    next_sequence: u64,
    published: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope to `topic` and return a copy of what was stored.
    pub fn publish(&mut self, topic: &str, event_type: &str, trace_id: &str, payload: Payload) -> Envelope {
        self.next_sequence += 1;
        self.published += 1;
        let env = Envelope {
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            trace_id: trace_id.to_string(),
            sequence: self.next_sequence,
            payload,
        };
        logging::log(
            logging::Level::Trace,
            Domain::Bus,
            "publish",
            obj(&[
                ("trace_id", v_str(trace_id)),
                ("topic", v_str(topic)),
                ("event_type", v_str(event_type)),
                ("sequence", v_int(env.sequence)),
            ]),
        );
        self.queue(topic).push_back(env.clone());
        env
    }

    /// Remove and return up to `max_items` envelopes in publish order.
    pub fn poll(&mut self, topic: &str, max_items: usize) -> Vec<Envelope> {
        let queue = self.queue(topic);
        let n = max_items.min(queue.len());
        queue.drain(..n).collect()
    }

    pub fn size(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, VecDeque::len)
    }

    pub fn total_pending(&self) -> usize {
        self.topics.values().map(VecDeque::len).sum()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Total number of envelopes ever published on this bus.
    pub fn published_count(&self) -> u64 {
        self.published
    }

    fn queue(&mut self, topic: &str) -> &mut VecDeque<Envelope> {
        self.topics.entry(topic.to_string()).or_default()
    }
}
