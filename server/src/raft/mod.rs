//! Consensus integration: the seam between the raft runtime and the
//! replication state machine, plus persistent log storage and snapshots.

pub mod node;
pub mod proposal;
mod segment;
pub mod snapshot;
pub mod storage;

use crate::error::Result;
use crate::raft::proposal::WriteCompletion;
pub use crate::raft::snapshot::{SnapshotReader, SnapshotWriter};

/// Invoked once when a background snapshot save finishes, carrying the
/// writer with its accumulated file manifest.
pub type SnapshotDone = Box<dyn FnOnce(Result<SnapshotWriter>) + Send + 'static>;

/// Callbacks the node loop drives on the replication state machine.
/// `on_apply` and the snapshot hooks are mutually exclusive; all of them run
/// on the node's own thread except `on_snapshot_save`, which hands the slow
/// part to a background task through its `done` callback.
pub trait ReplicaFsm: Send + Sync {
    /// Consume a batch of committed entries in log order.
    fn on_apply(&self, iter: &mut ApplyIter);

    /// Persist the durable state under `writer.path()` and report the
    /// written files through `done`.
    fn on_snapshot_save(&self, writer: SnapshotWriter, done: SnapshotDone);

    /// Replace the durable state with the snapshot under `reader.path()`.
    /// An error is fatal to the node.
    fn on_snapshot_load(&self, reader: &SnapshotReader) -> Result<()>;

    fn on_leader_start(&self, term: u64);

    fn on_leader_stop(&self);
}

/// One committed entry handed to the state machine. Entries submitted by
/// this node carry their completion back so the original request does not
/// need re-parsing.
pub struct ApplyItem {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
    pub completion: Option<WriteCompletion>,
}

/// Iterator over a batch of committed entries.
///
/// `next` marks the current entry as applied; `set_error_and_rollback`
/// stops iteration with the current entry still counting as unapplied, so
/// the runtime replays it after a restart.
pub struct ApplyIter {
    items: Vec<ApplyItem>,
    pos: usize,
    rolled_back: bool,
}

impl ApplyIter {
    pub(crate) fn new(items: Vec<ApplyItem>) -> ApplyIter {
        ApplyIter {
            items,
            pos: 0,
            rolled_back: false,
        }
    }

    pub fn valid(&self) -> bool {
        !self.rolled_back && self.pos < self.items.len()
    }

    pub fn index(&self) -> u64 {
        self.items[self.pos].index
    }

    pub fn term(&self) -> u64 {
        self.items[self.pos].term
    }

    pub fn data(&self) -> &[u8] {
        &self.items[self.pos].data
    }

    pub fn take_completion(&mut self) -> Option<WriteCompletion> {
        self.items[self.pos].completion.take()
    }

    pub fn next(&mut self) {
        self.pos += 1;
    }

    pub fn set_error_and_rollback(&mut self) {
        self.rolled_back = true;
    }

    pub(crate) fn rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Completions of entries that were never applied, to be failed by the
    /// node when a batch is abandoned.
    pub(crate) fn take_remaining_completions(&mut self) -> Vec<WriteCompletion> {
        self.items[self.pos..]
            .iter_mut()
            .filter_map(|item| item.completion.take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: u64) -> Vec<ApplyItem> {
        (1..=n)
            .map(|i| ApplyItem {
                index: i,
                term: 1,
                data: vec![i as u8],
                completion: None,
            })
            .collect()
    }

    #[test]
    fn test_iterates_in_log_order() {
        let mut iter = ApplyIter::new(items(3));
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.index());
            iter.next();
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(!iter.rolled_back());
    }

    #[test]
    fn test_rollback_stops_iteration() {
        let mut iter = ApplyIter::new(items(3));
        assert!(iter.valid());
        iter.next();
        iter.set_error_and_rollback();
        assert!(!iter.valid());
        assert!(iter.rolled_back());
    }
}
