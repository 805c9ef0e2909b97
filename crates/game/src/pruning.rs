//! Bounding retained undo history by block height.
//!
//! The controller records every attached block here; after each accepted
//! attach the queue computes the retention cutoff and asks storage to prune
//! undo records at or below it. Storage itself guarantees the current tip's
//! undo record is never removed, so even `keep = 0` (aggressive pruning)
//! leaves exactly one detach possible.

use std::collections::BTreeMap;

use tracing::debug;
use xayagame_store::{
    BlockHash,
    StorageInterface,
};

use crate::error::GameResult;

/// Height cache plus pruning policy.
#[derive(Debug)]
pub struct PruningQueue {
    /// Number of most recent blocks whose undo data is retained.
    keep: u64,
    /// Heights of blocks with undo data, in height order.
    heights: BTreeMap<u64, BlockHash>,
}

impl PruningQueue {
    pub fn new(keep: u64) -> Self {
        Self {
            keep,
            heights: BTreeMap::new(),
        }
    }

    pub fn keep(&self) -> u64 {
        self.keep
    }

    /// Record a newly attached block.
    pub fn record(&mut self, hash: BlockHash, height: u64) {
        self.heights.insert(height, hash);
    }

    /// Forget a block again after its undo data was consumed by a detach.
    pub fn forget(&mut self, height: u64) {
        self.heights.remove(&height);
    }

    /// Prune undo records outside the retention horizon. Called after every
    /// accepted attach, inside the same storage transaction.
    pub fn prune(
        &mut self,
        storage: &mut dyn StorageInterface,
        current_height: u64,
    ) -> GameResult<()> {
        let cutoff = current_height.saturating_sub(self.keep);
        if cutoff == 0 {
            return Ok(());
        }

        storage.prune_undo_data(cutoff)?;

        // Drop the cached entries that are gone now. split_off keeps
        // everything strictly above the cutoff.
        let keep = self.heights.split_off(&(cutoff + 1));
        let dropped = self.heights.len();
        self.heights = keep;
        if dropped > 0 {
            debug!(cutoff, dropped, "pruned undo history");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xayagame_store::MemoryStorage;

    fn hash(n: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[31] = n;
        BlockHash(bytes)
    }

    fn storage_with_undos(heights: &[u64]) -> MemoryStorage {
        let mut storage = MemoryStorage::new();
        storage.begin_transaction().unwrap();
        for &h in heights {
            #[allow(clippy::cast_possible_truncation)]
            let block = hash(h as u8);
            storage.add_undo_data(&block, h, &vec![h as u8]).unwrap();
        }
        let tip = *heights.last().unwrap();
        #[allow(clippy::cast_possible_truncation)]
        storage
            .set_current_game_state(&hash(tip as u8), &b"tip".to_vec())
            .unwrap();
        storage.commit_transaction().unwrap();
        storage
    }

    #[test]
    fn keeps_recent_blocks() {
        let mut storage = storage_with_undos(&[10, 11, 12, 13]);
        let mut queue = PruningQueue::new(2);
        for h in [10u64, 11, 12, 13] {
            #[allow(clippy::cast_possible_truncation)]
            queue.record(hash(h as u8), h);
        }

        storage.begin_transaction().unwrap();
        queue.prune(&mut storage, 13).unwrap();
        storage.commit_transaction().unwrap();

        // cutoff = 13 - 2 = 11: records at 10 and 11 go, 12 and 13 stay.
        assert_eq!(storage.get_undo_data(&hash(10)).unwrap(), None);
        assert_eq!(storage.get_undo_data(&hash(11)).unwrap(), None);
        assert!(storage.get_undo_data(&hash(12)).unwrap().is_some());
        assert!(storage.get_undo_data(&hash(13)).unwrap().is_some());
    }

    #[test]
    fn aggressive_pruning_spares_the_tip() {
        let mut storage = storage_with_undos(&[10, 11, 12]);
        let mut queue = PruningQueue::new(0);
        for h in [10u64, 11, 12] {
            #[allow(clippy::cast_possible_truncation)]
            queue.record(hash(h as u8), h);
        }

        storage.begin_transaction().unwrap();
        queue.prune(&mut storage, 12).unwrap();
        storage.commit_transaction().unwrap();

        assert_eq!(storage.get_undo_data(&hash(10)).unwrap(), None);
        assert_eq!(storage.get_undo_data(&hash(11)).unwrap(), None);
        // The tip's undo record survives even with keep = 0.
        assert!(storage.get_undo_data(&hash(12)).unwrap().is_some());
    }

    #[test]
    fn low_heights_do_not_underflow() {
        let mut storage = storage_with_undos(&[1, 2]);
        let mut queue = PruningQueue::new(10);
        queue.record(hash(1), 1);
        queue.record(hash(2), 2);

        storage.begin_transaction().unwrap();
        queue.prune(&mut storage, 2).unwrap();
        storage.commit_transaction().unwrap();

        assert!(storage.get_undo_data(&hash(1)).unwrap().is_some());
        assert!(storage.get_undo_data(&hash(2)).unwrap().is_some());
    }
}
