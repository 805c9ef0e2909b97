//! In-memory storage backend.
//!
//! Keeps everything in plain maps. Transactions snapshot the whole contents
//! on begin and restore the snapshot on rollback; with the small working set
//! of one tip plus a bounded undo history this is cheaper than tracking a
//! write set.

use std::collections::HashMap;

use tracing::trace;

use crate::{
    BlockHash,
    GameStateData,
    StorageError,
    StorageInterface,
    StorageResult,
    UndoData,
};

#[derive(Debug, Clone, Default)]
struct Contents {
    current: Option<(BlockHash, GameStateData)>,
    undo: HashMap<BlockHash, (u64, UndoData)>,
}

/// Non-durable storage for tests and throwaway games.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: Contents,
    /// Snapshot taken at `begin_transaction`, restored on rollback.
    snapshot: Option<Contents>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_transaction(&self) -> StorageResult<()> {
        if self.snapshot.is_none() {
            return Err(StorageError::Misuse("mutation outside a transaction"));
        }
        Ok(())
    }
}

impl StorageInterface for MemoryStorage {
    fn begin_transaction(&mut self) -> StorageResult<()> {
        if self.snapshot.is_some() {
            return Err(StorageError::Misuse("transaction already open"));
        }
        self.snapshot = Some(self.contents.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> StorageResult<()> {
        if self.snapshot.take().is_none() {
            return Err(StorageError::Misuse("commit without open transaction"));
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> StorageResult<()> {
        match self.snapshot.take() {
            Some(snapshot) => {
                trace!("rolling back in-memory transaction");
                self.contents = snapshot;
                Ok(())
            }
            None => Err(StorageError::Misuse("rollback without open transaction")),
        }
    }

    fn get_current_block_hash(&self) -> StorageResult<Option<BlockHash>> {
        Ok(self.contents.current.as_ref().map(|(h, _)| *h))
    }

    fn get_current_game_state(&self) -> StorageResult<GameStateData> {
        self.contents
            .current
            .as_ref()
            .map(|(_, s)| s.clone())
            .ok_or(StorageError::NoCurrentState)
    }

    fn set_current_game_state(
        &mut self,
        hash: &BlockHash,
        state: &GameStateData,
    ) -> StorageResult<()> {
        self.ensure_transaction()?;
        self.contents.current = Some((*hash, state.clone()));
        Ok(())
    }

    fn get_undo_data(&self, hash: &BlockHash) -> StorageResult<Option<UndoData>> {
        Ok(self.contents.undo.get(hash).map(|(_, d)| d.clone()))
    }

    fn add_undo_data(
        &mut self,
        hash: &BlockHash,
        height: u64,
        undo: &UndoData,
    ) -> StorageResult<()> {
        self.ensure_transaction()?;
        if let Some((_, existing)) = self.contents.undo.get(hash) {
            if existing != undo {
                return Err(StorageError::UndoMismatch(*hash));
            }
            return Ok(());
        }
        self.contents.undo.insert(*hash, (height, undo.clone()));
        Ok(())
    }

    fn release_undo_data(&mut self, hash: &BlockHash) -> StorageResult<()> {
        self.ensure_transaction()?;
        self.contents.undo.remove(hash);
        Ok(())
    }

    fn prune_undo_data(&mut self, height_cutoff: u64) -> StorageResult<()> {
        self.ensure_transaction()?;
        let tip = self.contents.current.as_ref().map(|(h, _)| *h);
        self.contents
            .undo
            .retain(|hash, (height, _)| *height > height_cutoff || Some(*hash) == tip);
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.ensure_transaction()?;
        self.contents = Contents::default();
        Ok(())
    }
}
