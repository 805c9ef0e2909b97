//! Durable storage on sled, an embedded log-structured key-value engine.
//!
//! ## Key layout
//!
//! ```text
//! meta/hash          -> 32-byte current tip hash
//! meta/state         -> current game state blob
//! undo/<hash:32>     -> [height: u64 be][undo blob]
//! ```
//!
//! ## Transactions
//!
//! Writes are buffered in an overlay map while a transaction is open; reads
//! consult the overlay before the tree. Commit materialises the overlay into
//! one `sled::Batch`, applies it atomically and flushes, so a crash leaves
//! either the pre-transaction or the fully committed state on disk.

use std::collections::HashMap;
use std::path::Path;

use tracing::{
    debug,
    trace,
};

use crate::{
    BlockHash,
    GameStateData,
    StorageError,
    StorageInterface,
    StorageResult,
    UndoData,
    hash::HASH_LEN,
};

const KEY_CURRENT_HASH: &[u8] = b"meta/hash";
const KEY_CURRENT_STATE: &[u8] = b"meta/state";
const UNDO_PREFIX: &[u8] = b"undo/";

fn undo_key(hash: &BlockHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(UNDO_PREFIX.len() + HASH_LEN);
    key.extend_from_slice(UNDO_PREFIX);
    key.extend_from_slice(hash.as_ref());
    key
}

fn encode_undo(height: u64, undo: &UndoData) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + undo.len());
    value.extend_from_slice(&height.to_be_bytes());
    value.extend_from_slice(undo);
    value
}

fn decode_undo(value: &[u8]) -> StorageResult<(u64, UndoData)> {
    if value.len() < 8 {
        return Err(StorageError::Corruption(
            "undo record shorter than its height prefix".to_string(),
        ));
    }
    let mut height = [0u8; 8];
    height.copy_from_slice(&value[..8]);
    Ok((u64::from_be_bytes(height), value[8..].to_vec()))
}

/// Durable storage backed by a sled database directory.
pub struct SledStorage {
    db: sled::Db,
    /// Overlay of the open transaction. `None` value means deletion.
    pending: Option<HashMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl SledStorage {
    /// Open (or create) the database under `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened sled storage");
        Ok(Self { db, pending: None })
    }

    fn overlay(&mut self) -> StorageResult<&mut HashMap<Vec<u8>, Option<Vec<u8>>>> {
        self.pending
            .as_mut()
            .ok_or(StorageError::Misuse("mutation outside a transaction"))
    }

    /// Read a key through the transaction overlay.
    fn read(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if let Some(pending) = &self.pending {
            if let Some(entry) = pending.get(key) {
                return Ok(entry.clone());
            }
        }
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    /// All live undo records `(key, value)` as seen through the overlay.
    fn undo_entries(&self) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        for item in self.db.scan_prefix(UNDO_PREFIX) {
            let (key, value) = item?;
            entries.insert(key.to_vec(), Some(value.to_vec()));
        }
        if let Some(pending) = &self.pending {
            for (key, value) in pending {
                if key.starts_with(UNDO_PREFIX) {
                    entries.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(entries
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }
}

impl StorageInterface for SledStorage {
    fn begin_transaction(&mut self) -> StorageResult<()> {
        if self.pending.is_some() {
            return Err(StorageError::Misuse("transaction already open"));
        }
        self.pending = Some(HashMap::new());
        Ok(())
    }

    fn commit_transaction(&mut self) -> StorageResult<()> {
        let pending = self
            .pending
            .take()
            .ok_or(StorageError::Misuse("commit without open transaction"))?;

        let mut batch = sled::Batch::default();
        for (key, value) in pending {
            match value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        trace!("committed sled batch");
        Ok(())
    }

    fn rollback_transaction(&mut self) -> StorageResult<()> {
        if self.pending.take().is_none() {
            return Err(StorageError::Misuse("rollback without open transaction"));
        }
        Ok(())
    }

    fn get_current_block_hash(&self) -> StorageResult<Option<BlockHash>> {
        match self.read(KEY_CURRENT_HASH)? {
            Some(bytes) => Ok(Some(BlockHash::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_current_game_state(&self) -> StorageResult<GameStateData> {
        self.read(KEY_CURRENT_STATE)?
            .ok_or(StorageError::NoCurrentState)
    }

    fn set_current_game_state(
        &mut self,
        hash: &BlockHash,
        state: &GameStateData,
    ) -> StorageResult<()> {
        let overlay = self.overlay()?;
        overlay.insert(KEY_CURRENT_HASH.to_vec(), Some(hash.as_ref().to_vec()));
        overlay.insert(KEY_CURRENT_STATE.to_vec(), Some(state.clone()));
        Ok(())
    }

    fn get_undo_data(&self, hash: &BlockHash) -> StorageResult<Option<UndoData>> {
        match self.read(&undo_key(hash))? {
            Some(value) => Ok(Some(decode_undo(&value)?.1)),
            None => Ok(None),
        }
    }

    fn add_undo_data(
        &mut self,
        hash: &BlockHash,
        height: u64,
        undo: &UndoData,
    ) -> StorageResult<()> {
        let key = undo_key(hash);
        if let Some(existing) = self.read(&key)? {
            let (_, existing_undo) = decode_undo(&existing)?;
            if &existing_undo != undo {
                return Err(StorageError::UndoMismatch(*hash));
            }
            return Ok(());
        }
        self.overlay()?.insert(key, Some(encode_undo(height, undo)));
        Ok(())
    }

    fn release_undo_data(&mut self, hash: &BlockHash) -> StorageResult<()> {
        self.overlay()?.insert(undo_key(hash), None);
        Ok(())
    }

    fn prune_undo_data(&mut self, height_cutoff: u64) -> StorageResult<()> {
        let tip_key = self.get_current_block_hash()?.map(|h| undo_key(&h));
        let entries = self.undo_entries()?;
        let overlay = self.overlay()?;
        for (key, value) in entries {
            if Some(&key) == tip_key.as_ref() {
                continue;
            }
            let (height, _) = decode_undo(&value)?;
            if height <= height_cutoff {
                overlay.insert(key, None);
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        if self.pending.is_none() {
            return Err(StorageError::Misuse("mutation outside a transaction"));
        }
        let mut keys: Vec<Vec<u8>> = vec![KEY_CURRENT_HASH.to_vec(), KEY_CURRENT_STATE.to_vec()];
        for item in self.db.iter() {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        let overlay = self.overlay()?;
        // Writes buffered in this very transaction must be dropped as well.
        let buffered: Vec<Vec<u8>> = overlay.keys().cloned().collect();
        for key in keys.into_iter().chain(buffered) {
            overlay.insert(key, None);
        }
        Ok(())
    }
}
