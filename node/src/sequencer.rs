use messages::BatchKey;
use std::collections::{BTreeSet, HashSet};

/// The ordered delivery log. Entries sort lexicographically on the batch's
/// vector-clock value tuple, with the batch key as tiebreak, so two nodes
/// delivering the same set of batches agree on the order.
#[derive(Default)]
pub struct Sequencer {
    log: BTreeSet<(Vec<u64>, BatchKey)>,
    keys: HashSet<BatchKey>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delivered batch. Returns false if the key was already
    /// sequenced; a batch is delivered at most once.
    pub fn insert(&mut self, clock_values: Vec<u64>, key: BatchKey) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        self.log.insert((clock_values, key));
        true
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// The ordered entries, oldest first.
    pub fn entries(&self) -> Vec<(Vec<u64>, BatchKey)> {
        self.log.iter().cloned().collect()
    }

    /// A stable digest over the ordered log, used to compare delivery logs
    /// across nodes.
    pub fn digest(&self) -> String {
        let mut rendering = String::new();
        for (values, key) in &self.log {
            for value in values {
                rendering.push_str(&value.to_string());
                rendering.push(',');
            }
            rendering.push(':');
            rendering.push_str(&key.to_string());
            rendering.push(';');
        }
        hex::encode(crypto::sha256(rendering.as_bytes()).0)
    }
}
