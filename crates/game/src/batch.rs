//! Batching of storage transactions.
//!
//! During catch-up, committing once per block would dominate the sync time,
//! so the transaction manager keeps one storage transaction open across up
//! to `batch_size` consecutive events and commits when the batch fills or a
//! timeout elapses. A rule failure rolls back the whole in-flight batch;
//! atomicity therefore spans several blocks, which is safe because readers
//! are serialised with the writer by the controller lock.

use std::time::{
    Duration,
    Instant,
};

use tracing::{
    debug,
    trace,
};
use xayagame_store::StorageInterface;

use crate::error::GameResult;

/// How long an unfilled batch may stay open before it is committed anyway.
const BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Wraps consecutive storage mutations into shared transactions.
#[derive(Debug)]
pub struct TransactionManager {
    batch_size: u32,
    /// Events committed into the currently open transaction.
    in_batch: u32,
    tx_open: bool,
    opened_at: Option<Instant>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            batch_size: 1,
            in_batch: 0,
            tx_open: false,
            opened_at: None,
        }
    }

    /// Set the number of events per storage transaction. A size of one means
    /// every event commits on its own; a pending batch larger than the new
    /// size is committed immediately.
    pub fn set_batch_size(
        &mut self,
        storage: &mut dyn StorageInterface,
        size: u32,
    ) -> GameResult<()> {
        debug!(size, "setting transaction batch size");
        self.batch_size = size.max(1);
        if self.tx_open && self.in_batch >= self.batch_size {
            self.flush(storage)?;
        }
        Ok(())
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Whether a storage transaction is currently open.
    pub fn transaction_open(&self) -> bool {
        self.tx_open
    }

    /// Open the storage transaction for the next event, reusing the batch's
    /// transaction if one is already open.
    pub fn begin(&mut self, storage: &mut dyn StorageInterface) -> GameResult<()> {
        if !self.tx_open {
            storage.begin_transaction()?;
            self.tx_open = true;
            self.opened_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Mark the current event as successfully applied and commit if the
    /// batch has filled or has been open for too long.
    pub fn maybe_commit(&mut self, storage: &mut dyn StorageInterface) -> GameResult<()> {
        assert!(self.tx_open, "maybe_commit without begin");
        self.in_batch += 1;

        let timed_out = self
            .opened_at
            .is_some_and(|t| t.elapsed() >= BATCH_TIMEOUT);
        if self.in_batch >= self.batch_size || timed_out {
            self.flush(storage)?;
        } else {
            trace!(in_batch = self.in_batch, "holding batch open");
        }
        Ok(())
    }

    /// Commit whatever is pending, if anything.
    pub fn flush(&mut self, storage: &mut dyn StorageInterface) -> GameResult<()> {
        if self.tx_open {
            storage.commit_transaction()?;
            trace!(events = self.in_batch, "committed batch");
            self.tx_open = false;
            self.in_batch = 0;
            self.opened_at = None;
        }
        Ok(())
    }

    /// Abandon the whole in-flight batch.
    pub fn rollback(&mut self, storage: &mut dyn StorageInterface) -> GameResult<()> {
        if self.tx_open {
            storage.rollback_transaction()?;
            debug!(events = self.in_batch, "rolled back batch");
            self.tx_open = false;
            self.in_batch = 0;
            self.opened_at = None;
        }
        Ok(())
    }
}
