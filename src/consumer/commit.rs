use std::collections::{BTreeMap, HashMap};

use crate::messaging::MessagePosition;

/// Position to commit and how many messages it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPoint {
    pub position: MessagePosition,
    pub messages: usize,
}

/// Turns out-of-order message completion into in-order commits.
///
/// Every pulled message is registered; a commit point only moves past an
/// offset once that offset and every earlier registered offset of the same
/// partition are complete.
#[derive(Debug, Default)]
pub struct CommitTracker {
    partitions: HashMap<(String, i32), BTreeMap<i64, bool>>,
}

impl CommitTracker {
    pub fn register(&mut self, position: &MessagePosition) {
        self.partitions
            .entry((position.topic.clone(), position.partition))
            .or_default()
            .insert(position.offset, false);
    }

    /// Mark `position` complete. Returns the new commit point if the
    /// contiguous completed prefix of its partition grew.
    pub fn complete(&mut self, position: &MessagePosition) -> Option<CommitPoint> {
        let offsets = self
            .partitions
            .get_mut(&(position.topic.clone(), position.partition))?;

        match offsets.get_mut(&position.offset) {
            Some(done) => *done = true,
            None => return None,
        }

        let mut committed = None;
        let mut messages = 0;
        while let Some(entry) = offsets.first_entry() {
            if !*entry.get() {
                break;
            }
            committed = Some(*entry.key());
            messages += 1;
            entry.remove();
        }

        committed.map(|offset| CommitPoint {
            position: MessagePosition {
                topic: position.topic.clone(),
                partition: position.partition,
                offset,
            },
            messages,
        })
    }

    /// Registered messages not yet covered by a commit point.
    pub fn pending(&self) -> usize {
        self.partitions.values().map(BTreeMap::len).sum()
    }
}
