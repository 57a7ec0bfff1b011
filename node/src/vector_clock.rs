use crypto::NodeId;
use std::collections::BTreeMap;

/// Per-creator monotonic counters. Entries appear on first touch; a missing
/// entry compares as zero.
#[derive(Clone, Debug, Default)]
pub struct VectorClock {
    counters: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter of a node, creating the entry if needed.
    pub fn increment(&mut self, id: &str) {
        *self.counters.entry(id.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, id: &str) -> u64 {
        self.counters.get(id).copied().unwrap_or(0)
    }

    /// The clock entries as attached to an outgoing batch.
    pub fn items(&self) -> Vec<(NodeId, u64)> {
        self.counters
            .iter()
            .map(|(id, counter)| (id.clone(), *counter))
            .collect()
    }
}
