//! # `xayagame-store`
//!
//! Transactional storage for block-indexed game states.
//!
//! The store keeps exactly one *current tip*, the pair of (block hash, game
//! state) the game has processed up to, plus one *undo record* per attached
//! block, sufficient to roll the state back one block at a time. Three
//! interchangeable engines implement the same interface:
//!
//! | Backend | Engine | Durability |
//! |---------|--------|------------|
//! | [`MemoryStorage`] | `HashMap` | none (process lifetime) |
//! | [`SledStorage`] | sled | crash-safe via atomic batch + flush |
//! | [`SqliteStorage`] | SQLite (WAL) | crash-safe via SQL transactions |
//!
//! All mutations must happen between [`StorageInterface::begin_transaction`]
//! and [`StorageInterface::commit_transaction`]; a rollback discards every
//! pending write. A backend never exposes a partially-committed state, even
//! across a process kill.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod hash;
pub mod memory;
pub mod sled_storage;
pub mod sqlite;

#[cfg(test)]
mod tests;

pub use hash::BlockHash;
pub use memory::MemoryStorage;
pub use sled_storage::SledStorage;
pub use sqlite::SqliteStorage;

/// Opaque serialised game state. Only the game rules know its schema.
pub type GameStateData = Vec<u8>;

/// Opaque undo blob emitted by a forward step and consumed by the matching
/// backward step. May be empty.
pub type UndoData = Vec<u8>;

/// Errors surfaced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An operation was used outside its contract (e.g. a mutation without
    /// an open transaction, or nested transactions).
    #[error("storage misuse: {0}")]
    Misuse(&'static str),

    /// No current game state has been stored yet.
    #[error("no current game state in storage")]
    NoCurrentState,

    /// A block hash string failed to parse.
    #[error("invalid block hash '{0}'")]
    InvalidHash(String),

    /// Undo data was re-added for the same block with different bytes.
    #[error("conflicting undo data for block {0}")]
    UndoMismatch(BlockHash),

    /// The on-disk representation violates an invariant of the schema.
    #[error("storage corruption: {0}")]
    Corruption(String),

    /// Underlying sled engine error.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Underlying SQLite engine error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error while opening or preparing a backend.
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Transactional key-value store for the current game state and per-block
/// undo data.
///
/// ## Contracts
///
/// - Every mutator (`set_current_game_state`, `add_undo_data`,
///   `release_undo_data`, `prune_undo_data`, `clear`) fails with
///   [`StorageError::Misuse`] unless a transaction is open.
/// - Between begin and commit, reads observe the pending writes; rollback
///   discards them all.
/// - `set_current_game_state` updates the current hash and state atomically;
///   there is never a moment where only one of the two is visible.
/// - `add_undo_data` is idempotent for identical bytes and fails with
///   [`StorageError::UndoMismatch`] for conflicting bytes.
/// - `prune_undo_data(h)` removes every undo record with height `<= h`,
///   except the record belonging to the current tip.
pub trait StorageInterface: Send + Sync {
    /// Open a transaction. Fails if one is already open.
    fn begin_transaction(&mut self) -> StorageResult<()>;

    /// Commit the open transaction, making its writes durable.
    fn commit_transaction(&mut self) -> StorageResult<()>;

    /// Discard all writes of the open transaction.
    fn rollback_transaction(&mut self) -> StorageResult<()>;

    /// The hash of the current tip, or `None` before initialisation.
    fn get_current_block_hash(&self) -> StorageResult<Option<BlockHash>>;

    /// The game state at the current tip.
    fn get_current_game_state(&self) -> StorageResult<GameStateData>;

    /// Atomically set the current tip to `(hash, state)`.
    fn set_current_game_state(
        &mut self,
        hash: &BlockHash,
        state: &GameStateData,
    ) -> StorageResult<()>;

    /// Undo data recorded for `hash`, if any.
    fn get_undo_data(&self, hash: &BlockHash) -> StorageResult<Option<UndoData>>;

    /// Record undo data for the block `hash` at `height`.
    fn add_undo_data(
        &mut self,
        hash: &BlockHash,
        height: u64,
        undo: &UndoData,
    ) -> StorageResult<()>;

    /// Drop the undo record for `hash`. Dropping a missing record is a no-op.
    fn release_undo_data(&mut self, hash: &BlockHash) -> StorageResult<()>;

    /// Drop every undo record with height `<= height_cutoff`, keeping the
    /// record of the current tip regardless of its height.
    fn prune_undo_data(&mut self, height_cutoff: u64) -> StorageResult<()>;

    /// Wipe everything: current tip and all undo records.
    fn clear(&mut self) -> StorageResult<()>;
}
