//! # SQLite game adapter
//!
//! Games whose state lives in SQL tables implement [`SqliteGameLogic`]
//! instead of [`GameLogic`]: the real state is the database, and the
//! controller-visible `GameStateData` degenerates to a sentinel, `initial`
//! before the first block and `block <hex>` afterwards. The adapter pairs the
//! sentinel with the storage tip and refuses requests whose claimed tip
//! does not match.
//!
//! Undo data is not produced by user code: the adapter records the inverse
//! of every data change made by `update_state` (see [`journal`]) and
//! replays it on detach. The [`IdAllocator`] table rides in the same
//! journal, so generated IDs are rolled back and replayed deterministically.
//!
//! Everything (game tables, the `xayagame_ids` counters, the storage's own
//! `current`/`undo` tables) lives in one database file, and user SQL runs
//! inside the storage transaction the controller has opened. A failure
//! anywhere unwinds to the savepoint taken before the step.

mod ids;
mod journal;


pub use ids::IdAllocator;

use std::sync::Arc;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};

use anyhow::{
    Context,
    bail,
};
use parking_lot::Mutex;
use rusqlite::{
    Connection,
    OptionalExtension,
};
use tracing::{
    debug,
    info,
};
use xayagame_store::{
    BlockHash,
    GameStateData,
    SqliteStorage,
    StorageInterface,
    UndoData,
};

use crate::{
    chain::ChainId,
    error::{
        GameError,
        GameResult,
    },
    events::BlockData,
    logic::{
        GameLogic,
        InitialState,
    },
};

/// Sentinel for the state before any block was processed.
const INITIAL_SENTINEL: &str = "initial";
/// Prefix of the per-block sentinel.
const BLOCK_SENTINEL_PREFIX: &str = "block ";

const ADAPTER_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS `xayagame_init` (
    `id` INTEGER PRIMARY KEY CHECK (`id` = 1),
    `done` INTEGER NOT NULL
);
";

/// What the rules see while their SQL runs.
pub struct SqliteGameContext<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteGameContext<'a> {
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// The named ID range `name`.
    pub fn ids(&self, name: &'a str) -> IdAllocator<'a> {
        IdAllocator::new(self.conn, name)
    }
}

/// SQL-backed game rules, supplied by the embedding application.
pub trait SqliteGameLogic: Send {
    /// The block the game's initial state belongs to.
    fn initial_state_block(&self) -> (u64, BlockHash);

    /// Create the game's tables. Called once per database open, inside a
    /// transaction; must be idempotent (`CREATE TABLE IF NOT EXISTS`).
    fn setup_schema(&mut self, ctx: &SqliteGameContext) -> anyhow::Result<()>;

    /// Fill in the initial game state. Called lazily, at most once per
    /// database lifetime, inside a savepoint: on error everything is rolled
    /// back and the next access retries.
    fn initialise_state(&mut self, ctx: &SqliteGameContext) -> anyhow::Result<()>;

    /// Apply one block's moves to the database state.
    fn update_state(&mut self, ctx: &SqliteGameContext, block: &BlockData) -> anyhow::Result<()>;

    /// Render the current database state as JSON.
    fn get_state_as_json(&mut self, ctx: &SqliteGameContext) -> anyhow::Result<serde_json::Value>;
}

struct Inner<L> {
    storage: SqliteStorage,
    logic: Mutex<L>,
    genesis_height: u64,
    genesis_hash: BlockHash,
    init_done: AtomicBool,
    chain: Mutex<Option<ChainId>>,
}

/// Adapter presenting a [`SqliteGameLogic`] as a [`GameLogic`]. Clones
/// share the database and rules, which lets tests keep a handle after the
/// controller takes ownership.
pub struct SqliteGame<L: SqliteGameLogic> {
    inner: Arc<Inner<L>>,
}

impl<L: SqliteGameLogic> Clone for SqliteGame<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Sentinel {
    Initial,
    Block(BlockHash),
}

fn classify(state: &GameStateData) -> anyhow::Result<Sentinel> {
    let text = std::str::from_utf8(state)
        .map_err(|_| anyhow::anyhow!("Unexpected game state value (not UTF-8)"))?;
    if text == INITIAL_SENTINEL {
        return Ok(Sentinel::Initial);
    }
    if let Some(hex) = text.strip_prefix(BLOCK_SENTINEL_PREFIX) {
        if let Ok(hash) = BlockHash::from_hex(hex) {
            return Ok(Sentinel::Block(hash));
        }
    }
    bail!("Unexpected game state value '{text}'");
}

fn block_sentinel(hash: BlockHash) -> GameStateData {
    format!("{BLOCK_SENTINEL_PREFIX}{}", hash.to_hex()).into_bytes()
}

impl<L: SqliteGameLogic> SqliteGame<L> {
    /// Open (or create) the game database at `path` (`:memory:` for an
    /// ephemeral one) and run schema setup.
    pub fn new(path: &str, mut logic: L) -> GameResult<Self> {
        let storage = if path == ":memory:" {
            SqliteStorage::open_in_memory()?
        } else {
            SqliteStorage::open(path)?
        };
        let (genesis_height, genesis_hash) = logic.initial_state_block();

        storage
            .with_connection(|conn| -> anyhow::Result<()> {
                conn.execute_batch("SAVEPOINT xg_setup")?;
                let result = (|| -> anyhow::Result<()> {
                    conn.execute_batch(ids::IDS_SCHEMA)?;
                    conn.execute_batch(ADAPTER_SCHEMA)?;
                    logic.setup_schema(&SqliteGameContext { conn })
                })();
                match result {
                    Ok(()) => {
                        conn.execute_batch("RELEASE xg_setup")?;
                        Ok(())
                    }
                    Err(err) => {
                        conn.execute_batch("ROLLBACK TO xg_setup; RELEASE xg_setup;")?;
                        Err(err)
                    }
                }
            })
            .map_err(GameError::Rule)?;
        info!(path, genesis = %genesis_hash, "sqlite game opened");

        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                logic: Mutex::new(logic),
                genesis_height,
                genesis_hash,
                init_done: AtomicBool::new(false),
                chain: Mutex::new(None),
            }),
        })
    }

    /// The storage the controller should use: it shares this game's
    /// database connection.
    pub fn storage(&self) -> SqliteStorage {
        self.inner.storage.clone()
    }

    /// The chain discovered by the controller, once known.
    pub fn chain(&self) -> Option<ChainId> {
        *self.inner.chain.lock()
    }

    fn sentinel_for(&self, hash: BlockHash) -> GameStateData {
        if hash == self.inner.genesis_hash {
            INITIAL_SENTINEL.as_bytes().to_vec()
        } else {
            block_sentinel(hash)
        }
    }

    /// Check that a sentinel names the storage tip.
    fn verify_sentinel(&self, state: &GameStateData) -> anyhow::Result<()> {
        let tip = self
            .inner
            .storage
            .get_current_block_hash()
            .context("reading storage tip")?;
        match classify(state)? {
            Sentinel::Initial => {
                if tip != Some(self.inner.genesis_hash) {
                    bail!(
                        "current block {} does not match the game's initial block {}",
                        tip.map_or_else(|| "<none>".to_string(), |h| h.to_hex()),
                        self.inner.genesis_hash
                    );
                }
            }
            Sentinel::Block(hash) => {
                if tip != Some(hash) {
                    bail!(
                        "block {hash} does not match claimed current game state (tip {})",
                        tip.map_or_else(|| "<none>".to_string(), |h| h.to_hex()),
                    );
                }
            }
        }
        Ok(())
    }

    /// Run the user's state initialisation at most once per database
    /// lifetime, inside a savepoint together with the persisted marker.
    fn ensure_initialised(&self) -> anyhow::Result<()> {
        if self.inner.init_done.load(Ordering::Acquire) {
            return Ok(());
        }

        self.inner.storage.with_connection(|conn| {
            let done: Option<i64> = conn
                .query_row("SELECT `done` FROM `xayagame_init` WHERE `id` = 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            if done == Some(1) {
                self.inner.init_done.store(true, Ordering::Release);
                return Ok(());
            }

            conn.execute_batch("SAVEPOINT xg_init")?;
            let result = (|| -> anyhow::Result<()> {
                let mut logic = self.inner.logic.lock();
                logic.initialise_state(&SqliteGameContext { conn })?;
                conn.execute(
                    "INSERT INTO `xayagame_init` (`id`, `done`) VALUES (1, 1)",
                    [],
                )?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    conn.execute_batch("RELEASE xg_init")?;
                    self.inner.init_done.store(true, Ordering::Release);
                    debug!("game database initialised");
                    Ok(())
                }
                Err(err) => {
                    conn.execute_batch("ROLLBACK TO xg_init; RELEASE xg_init;")?;
                    Err(err)
                }
            }
        })
    }

    fn state_as_json(&self) -> anyhow::Result<serde_json::Value> {
        self.inner.storage.with_connection(|conn| {
            let mut logic = self.inner.logic.lock();
            logic.get_state_as_json(&SqliteGameContext { conn })
        })
    }
}

impl<L: SqliteGameLogic> GameLogic for SqliteGame<L> {
    fn set_chain(&mut self, chain: ChainId) {
        *self.inner.chain.lock() = Some(chain);
    }

    fn initial_state(&mut self) -> anyhow::Result<InitialState> {
        Ok(InitialState {
            height: self.inner.genesis_height,
            hash: Some(self.inner.genesis_hash),
            state: INITIAL_SENTINEL.as_bytes().to_vec(),
        })
    }

    fn process_forward(
        &mut self,
        old_state: &GameStateData,
        block: &BlockData,
    ) -> anyhow::Result<(GameStateData, UndoData)> {
        self.verify_sentinel(old_state)?;
        self.ensure_initialised()?;

        let undo = self.inner.storage.with_connection(|conn| {
            conn.execute_batch("SAVEPOINT xg_forward")?;
            let capture = journal::Capture::start(conn);

            let result = {
                let mut logic = self.inner.logic.lock();
                logic.update_state(&SqliteGameContext { conn }, block)
            };

            match result {
                Ok(()) => match capture.finish(conn) {
                    Ok(undo) => {
                        conn.execute_batch("RELEASE xg_forward")?;
                        Ok(undo)
                    }
                    Err(err) => {
                        conn.execute_batch("ROLLBACK TO xg_forward; RELEASE xg_forward;")?;
                        Err(err)
                    }
                },
                Err(err) => {
                    capture.abort(conn);
                    conn.execute_batch("ROLLBACK TO xg_forward; RELEASE xg_forward;")?;
                    Err(err)
                }
            }
        })?;

        Ok((block_sentinel(block.hash), undo))
    }

    fn process_backwards(
        &mut self,
        old_state: &GameStateData,
        block: &BlockData,
        undo: &UndoData,
    ) -> anyhow::Result<GameStateData> {
        self.verify_sentinel(old_state)?;

        self.inner.storage.with_connection(|conn| {
            conn.execute_batch("SAVEPOINT xg_backward")?;
            match journal::apply_inverse(conn, undo) {
                Ok(()) => {
                    conn.execute_batch("RELEASE xg_backward")?;
                    Ok(())
                }
                Err(err) => {
                    conn.execute_batch("ROLLBACK TO xg_backward; RELEASE xg_backward;")?;
                    Err(err)
                }
            }
        })?;

        Ok(self.sentinel_for(block.parent))
    }

    fn game_state_to_json(&self, state: &GameStateData) -> anyhow::Result<serde_json::Value> {
        self.verify_sentinel(state)?;
        if matches!(classify(state)?, Sentinel::Initial) {
            self.ensure_initialised()?;
        }
        self.state_as_json()
    }
}
