//! Passive per-topic counters
//!
//! The tracker subscribes to bus topics and accumulates monotonically
//! increasing counters. It exposes a read-only query interface and never
//! publishes, so it cannot feed back into the simulation.

use std::collections::BTreeMap;

use crate::bus::Topic;

/// Tracks how many events each watched topic has carried.
#[derive(Debug, Default, Clone)]
pub struct Tracker {
    counts: BTreeMap<Topic, u64>,
}

impl Tracker {
    pub fn new() -> Self {
        Tracker::default()
    }

    /// Record one occurrence of `topic`.
    pub fn observe(&mut self, topic: Topic) {
        *self.counts.entry(topic).or_insert(0) += 1;
    }

    /// Events seen on `topic` so far; zero for never-observed topics.
    pub fn count(&self, topic: Topic) -> u64 {
        self.counts.get(&topic).copied().unwrap_or(0)
    }

    /// Copy of all counters.
    pub fn snapshot(&self) -> BTreeMap<Topic, u64> {
        self.counts.clone()
    }

    /// True while some arrived request has not been decided yet.
    pub fn has_pending(&self) -> bool {
        self.count(Topic::RequestArrive)
            > self.count(Topic::RequestAccept) + self.count(Topic::RequestReject)
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}
