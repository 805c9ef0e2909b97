//! Durable storage on SQLite.
//!
//! One database file holds the `current` row (the tip) and the `undo` table;
//! the SQLite game adapter adds its own tables to the same file and runs its
//! SQL inside the storage transaction, which is why the connection handle is
//! shared behind a mutex and `SqliteStorage` is cheap to clone.
//!
//! Transactions map directly onto SQL `BEGIN IMMEDIATE` / `COMMIT` /
//! `ROLLBACK`; crash recovery is inherited from SQLite's write-ahead log.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{
    Connection,
    OptionalExtension,
    params,
};
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
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS `current` (
    `id` INTEGER PRIMARY KEY CHECK (`id` = 1),
    `hash` BLOB NOT NULL,
    `state` BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS `undo` (
    `hash` BLOB PRIMARY KEY,
    `height` INTEGER NOT NULL,
    `data` BLOB NOT NULL
);
";

struct Inner {
    conn: Connection,
    in_tx: bool,
}

/// SQLite-backed storage. Clones share one connection.
#[derive(Clone)]
pub struct SqliteStorage {
    inner: Arc<Mutex<Inner>>,
}

impl SqliteStorage {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened sqlite storage");
        Self::from_connection(conn)
    }

    /// Open a private in-memory database (used heavily in tests).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a result row, so it cannot go through
        // execute_batch.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner { conn, in_tx: false })),
        })
    }

    /// Run a closure against the shared connection.
    ///
    /// The game adapter uses this to execute user SQL inside the storage
    /// transaction the controller has opened.
    pub fn with_connection<T, E>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, E>,
    ) -> Result<T, E> {
        let inner = self.inner.lock();
        f(&inner.conn)
    }

    /// Whether a storage transaction is currently open.
    pub fn transaction_open(&self) -> bool {
        self.inner.lock().in_tx
    }

    fn read_tip_hash(conn: &Connection) -> StorageResult<Option<BlockHash>> {
        let row: Option<Vec<u8>> = conn
            .query_row("SELECT `hash` FROM `current` WHERE `id` = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match row {
            Some(bytes) => Ok(Some(BlockHash::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl StorageInterface for SqliteStorage {
    fn begin_transaction(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.in_tx {
            return Err(StorageError::Misuse("transaction already open"));
        }
        inner.conn.execute_batch("BEGIN IMMEDIATE")?;
        inner.in_tx = true;
        Ok(())
    }

    fn commit_transaction(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if !inner.in_tx {
            return Err(StorageError::Misuse("commit without open transaction"));
        }
        inner.conn.execute_batch("COMMIT")?;
        inner.in_tx = false;
        trace!("committed sqlite transaction");
        Ok(())
    }

    fn rollback_transaction(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if !inner.in_tx {
            return Err(StorageError::Misuse("rollback without open transaction"));
        }
        inner.conn.execute_batch("ROLLBACK")?;
        inner.in_tx = false;
        Ok(())
    }

    fn get_current_block_hash(&self) -> StorageResult<Option<BlockHash>> {
        let inner = self.inner.lock();
        Self::read_tip_hash(&inner.conn)
    }

    fn get_current_game_state(&self) -> StorageResult<GameStateData> {
        let inner = self.inner.lock();
        inner
            .conn
            .query_row("SELECT `state` FROM `current` WHERE `id` = 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(StorageError::NoCurrentState)
    }

    fn set_current_game_state(
        &mut self,
        hash: &BlockHash,
        state: &GameStateData,
    ) -> StorageResult<()> {
        let inner = self.inner.lock();
        if !inner.in_tx {
            return Err(StorageError::Misuse("mutation outside a transaction"));
        }
        inner.conn.execute(
            "INSERT INTO `current` (`id`, `hash`, `state`) VALUES (1, ?1, ?2)
             ON CONFLICT (`id`) DO UPDATE SET `hash` = excluded.`hash`,
                                              `state` = excluded.`state`",
            params![hash.as_ref(), state],
        )?;
        Ok(())
    }

    fn get_undo_data(&self, hash: &BlockHash) -> StorageResult<Option<UndoData>> {
        let inner = self.inner.lock();
        Ok(inner
            .conn
            .query_row(
                "SELECT `data` FROM `undo` WHERE `hash` = ?1",
                params![hash.as_ref()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn add_undo_data(
        &mut self,
        hash: &BlockHash,
        height: u64,
        undo: &UndoData,
    ) -> StorageResult<()> {
        let inner = self.inner.lock();
        if !inner.in_tx {
            return Err(StorageError::Misuse("mutation outside a transaction"));
        }
        let existing: Option<Vec<u8>> = inner
            .conn
            .query_row(
                "SELECT `data` FROM `undo` WHERE `hash` = ?1",
                params![hash.as_ref()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            if &existing != undo {
                return Err(StorageError::UndoMismatch(*hash));
            }
            return Ok(());
        }
        inner.conn.execute(
            "INSERT INTO `undo` (`hash`, `height`, `data`) VALUES (?1, ?2, ?3)",
            params![hash.as_ref(), i64::try_from(height).unwrap_or(i64::MAX), undo],
        )?;
        Ok(())
    }

    fn release_undo_data(&mut self, hash: &BlockHash) -> StorageResult<()> {
        let inner = self.inner.lock();
        if !inner.in_tx {
            return Err(StorageError::Misuse("mutation outside a transaction"));
        }
        inner.conn.execute(
            "DELETE FROM `undo` WHERE `hash` = ?1",
            params![hash.as_ref()],
        )?;
        Ok(())
    }

    fn prune_undo_data(&mut self, height_cutoff: u64) -> StorageResult<()> {
        let inner = self.inner.lock();
        if !inner.in_tx {
            return Err(StorageError::Misuse("mutation outside a transaction"));
        }
        let cutoff = i64::try_from(height_cutoff).unwrap_or(i64::MAX);
        match Self::read_tip_hash(&inner.conn)? {
            Some(tip) => {
                inner.conn.execute(
                    "DELETE FROM `undo` WHERE `height` <= ?1 AND `hash` <> ?2",
                    params![cutoff, tip.as_ref()],
                )?;
            }
            None => {
                inner
                    .conn
                    .execute("DELETE FROM `undo` WHERE `height` <= ?1", params![cutoff])?;
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        let inner = self.inner.lock();
        if !inner.in_tx {
            return Err(StorageError::Misuse("mutation outside a transaction"));
        }
        inner
            .conn
            .execute_batch("DELETE FROM `current`; DELETE FROM `undo`;")?;
        Ok(())
    }
}
