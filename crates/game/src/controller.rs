//! # Game controller
//!
//! The controller couples storage, the game rules and the node into one
//! state machine. All state transitions happen on the writer thread, in
//! event-queue order; the event thread only decodes and enqueues, and RPC
//! readers are serialised against the writer through a read-write lock.
//!
//! ```text
//! ┌────────────┐ raw frames ┌────────────┐ ControllerMsg ┌────────────┐
//! │ node       │──────────▶│ subscriber  │──────────────▶│ writer     │
//! │ (pub sock) │           │ (event thr) │   crossbeam   │ (run loop) │
//! └────────────┘           └────────────┘               └─────┬──────┘
//!                                                             │ owns
//!                                                   ┌─────────▼─────────┐
//!                                                   │ storage + rules   │
//!                                                   └───────────────────┘
//! ```
//!
//! ## Synchronisation states
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Unknown` | not yet talked to the node |
//! | `Pregenesis` | chain height below the game's genesis |
//! | `OutOfSync` | tip known but differs from the node's best block |
//! | `CatchingUp` | backlog requested, applying tagged updates |
//! | `UpToDate` | tip equals the node's best block |
//! | `Disconnected` | event stream stalled, waiting for reconnect |
//! | `Stopped` | shut down |

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{
    Receiver,
    Sender,
    unbounded,
};
use metrics::counter;
use parking_lot::{
    Condvar,
    Mutex,
    RwLock,
};
use serde_json::json;
use tracing::{
    debug,
    error,
    info,
    warn,
};
use xayagame_store::{
    BlockHash,
    StorageInterface,
};

use crate::{
    batch::TransactionManager,
    chain::ChainId,
    error::{
        GameError,
        GameResult,
    },
    events::BlockData,
    logic::GameLogic,
    pruning::PruningQueue,
    rpc::client::{
        BlockchainInfo,
        NodeRpc,
    },
    subscriber::{
        EventTransport,
        Subscriber,
    },
};

/// Events per storage transaction while replaying a backlog.
const CATCHUP_BATCH_SIZE: u32 = 1000;

/// Consecutive rule failures on one event before giving up.
const MAX_RULE_FAILURES: u32 = 3;

/// How long `waitforchange` blocks before answering with an unchanged tip.
pub const WAIT_FOR_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages flowing from the event thread (and the public API) to the
/// writer thread.
#[derive(Debug)]
pub(crate) enum ControllerMsg {
    Attach(BlockData),
    Detach(BlockData),
    /// The event transport (re-)connected; redo the RPC hello.
    Connected,
    /// The event stream stalled; discard buffers and wait for reconnect.
    Stalled,
    /// An event was malformed or a sequence number was skipped.
    Desync,
    Stop,
}

/// Synchronisation state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unknown,
    Pregenesis,
    OutOfSync,
    CatchingUp,
    UpToDate,
    Disconnected,
    Stopped,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Unknown => "unknown",
            SyncState::Pregenesis => "pre-genesis",
            SyncState::OutOfSync => "out of sync",
            SyncState::CatchingUp => "catching up",
            SyncState::UpToDate => "up to date",
            SyncState::Disconnected => "disconnected",
            SyncState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Signal for `waitforchange`: the latest tip plus a condition variable
/// notified on every change.
pub(crate) struct TipSignal {
    current: Mutex<BlockHash>,
    cond: Condvar,
}

impl TipSignal {
    fn new() -> Self {
        Self {
            current: Mutex::new(BlockHash::NULL),
            cond: Condvar::new(),
        }
    }

    fn notify(&self, tip: BlockHash) {
        let mut current = self.current.lock();
        *current = tip;
        self.cond.notify_all();
    }

    /// Wake all waiters without a tip change (used on shutdown).
    fn wake_all(&self) {
        let _guard = self.current.lock();
        self.cond.notify_all();
    }

    fn wait(&self, known: Option<BlockHash>, timeout: Duration) -> BlockHash {
        let mut current = self.current.lock();
        if let Some(known) = known {
            if *current != known {
                return *current;
            }
        }
        self.cond.wait_for(&mut current, timeout);
        *current
    }
}

/// The writer-thread-owned half of the controller.
pub(crate) struct Core {
    game_id: String,
    state: SyncState,
    chain: Option<ChainId>,
    storage: Option<Box<dyn StorageInterface>>,
    logic: Option<Box<dyn GameLogic>>,
    rpc: Option<Box<dyn NodeRpc>>,
    txmgr: TransactionManager,
    pruning: Option<PruningQueue>,
    /// Height of the game's genesis block, learned from the rules.
    genesis_height: Option<u64>,
    /// Height of the current tip, tracked alongside storage.
    tip_height: Option<u64>,
    /// Token of the outstanding `game_sendupdates` request.
    reqtoken: Option<String>,
    /// End block announced for the outstanding update request.
    catchup_target: Option<BlockHash>,
    /// Untagged events received while catching up, replayed afterwards.
    pending: VecDeque<ControllerMsg>,
    /// Consecutive rule failures on one event hash.
    failures: Option<(BlockHash, u32)>,
    tip_signal: Arc<TipSignal>,
}

impl Core {
    fn new(game_id: String, tip_signal: Arc<TipSignal>) -> Self {
        Self {
            game_id,
            state: SyncState::Unknown,
            chain: None,
            storage: None,
            logic: None,
            rpc: None,
            txmgr: TransactionManager::new(),
            pruning: None,
            genesis_height: None,
            tip_height: None,
            reqtoken: None,
            catchup_target: None,
            pending: VecDeque::new(),
            failures: None,
            tip_signal,
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        self.state
    }

    fn set_state(&mut self, state: SyncState) {
        if state != self.state {
            info!(from = %self.state, to = %state, "sync state change");
            self.state = state;
        }
    }

    /// Dispatch one message. Returns `false` when the loop should stop.
    pub(crate) fn handle_message(&mut self, msg: ControllerMsg) -> GameResult<bool> {
        match msg {
            ControllerMsg::Attach(block) => self.on_attach(block)?,
            ControllerMsg::Detach(block) => self.on_detach(block)?,
            ControllerMsg::Connected => {
                self.set_state(SyncState::Unknown);
                self.connect()?;
            }
            ControllerMsg::Stalled => self.on_stalled()?,
            ControllerMsg::Desync => self.on_desync()?,
            ControllerMsg::Stop => {
                self.shutdown()?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// RPC hello: discover (and pin) the chain, then synchronise.
    pub(crate) fn connect(&mut self) -> GameResult<()> {
        let rpc = self
            .rpc
            .as_deref()
            .ok_or_else(|| GameError::Config("no node RPC configured".to_string()))?;

        let net = rpc.network_info()?;
        info!(version = net.version, subversion = %net.subversion, "connected to node");

        let info = rpc.blockchain_info()?;
        let chain: ChainId = info.chain.parse()?;
        match self.chain {
            None => {
                info!(%chain, "discovered chain");
                self.chain = Some(chain);
                if let Some(logic) = self.logic.as_deref_mut() {
                    logic.set_chain(chain);
                }
            }
            Some(existing) if existing != chain => {
                return Err(GameError::Invariant(format!(
                    "node switched chains from {existing} to {chain}"
                )));
            }
            Some(_) => {}
        }

        self.sync(&info)
    }

    /// Re-query the node and synchronise from the stored tip.
    fn resync(&mut self) -> GameResult<()> {
        let rpc = self
            .rpc
            .as_deref()
            .ok_or_else(|| GameError::Config("no node RPC configured".to_string()))?;
        let info = rpc.blockchain_info()?;
        self.sync(&info)
    }

    /// Decide where we stand relative to the node's best block.
    fn sync(&mut self, info: &BlockchainInfo) -> GameResult<()> {
        let storage = self
            .storage
            .as_deref()
            .ok_or_else(|| GameError::Config("no storage configured".to_string()))?;

        match storage.get_current_block_hash()? {
            None => self.initialise_state(info),
            Some(tip) => {
                if tip == info.best_block_hash {
                    self.tip_height = Some(info.blocks);
                    self.enter_up_to_date()
                } else {
                    self.set_state(SyncState::OutOfSync);
                    self.request_updates(tip)
                }
            }
        }
    }

    /// Store the rule-declared initial state once the chain has reached the
    /// game's genesis height.
    fn initialise_state(&mut self, info: &BlockchainInfo) -> GameResult<()> {
        let logic = self
            .logic
            .as_deref_mut()
            .ok_or_else(|| GameError::Config("no game logic configured".to_string()))?;
        let init = logic.initial_state().map_err(GameError::Rule)?;
        self.genesis_height = Some(init.height);

        if info.blocks < init.height {
            debug!(
                chain_height = info.blocks,
                genesis = init.height,
                "chain has not reached the game's genesis yet"
            );
            self.set_state(SyncState::Pregenesis);
            return Ok(());
        }

        let rpc = self
            .rpc
            .as_deref()
            .ok_or_else(|| GameError::Config("no node RPC configured".to_string()))?;
        let genesis_hash = rpc.block_hash(init.height)?;
        if let Some(declared) = init.hash {
            if declared != genesis_hash {
                return Err(GameError::Invariant(format!(
                    "game genesis hash {declared} does not match chain hash {genesis_hash} \
                     at height {}",
                    init.height
                )));
            }
        }

        let storage = self
            .storage
            .as_deref_mut()
            .ok_or_else(|| GameError::Config("no storage configured".to_string()))?;
        self.txmgr.begin(storage)?;
        storage.set_current_game_state(&genesis_hash, &init.state)?;
        self.txmgr.maybe_commit(storage)?;
        self.tip_height = Some(init.height);
        self.tip_signal.notify(genesis_hash);
        info!(hash = %genesis_hash, height = init.height, "initialised game state");

        if genesis_hash == info.best_block_hash {
            self.enter_up_to_date()
        } else {
            self.set_state(SyncState::OutOfSync);
            self.request_updates(genesis_hash)
        }
    }

    /// Ask the node to replay everything between `from` and its best block.
    fn request_updates(&mut self, from: BlockHash) -> GameResult<()> {
        let rpc = self
            .rpc
            .as_deref()
            .ok_or_else(|| GameError::Config("no node RPC configured".to_string()))?;
        let updates = rpc.send_updates(&from, &self.game_id)?;
        info!(
            from = %from,
            to = %updates.to_block,
            attach = updates.steps.attach,
            detach = updates.steps.detach,
            reqtoken = %updates.reqtoken,
            "requested block updates"
        );

        self.reqtoken = Some(updates.reqtoken);
        self.catchup_target = Some(updates.to_block);
        if let Some(storage) = self.storage.as_deref_mut() {
            self.txmgr.set_batch_size(storage, CATCHUP_BATCH_SIZE)?;
        }
        self.set_state(SyncState::CatchingUp);
        Ok(())
    }

    /// Flush batching and replay events buffered during catch-up.
    fn enter_up_to_date(&mut self) -> GameResult<()> {
        if let Some(storage) = self.storage.as_deref_mut() {
            self.txmgr.flush(storage)?;
            self.txmgr.set_batch_size(storage, 1)?;
        }
        self.reqtoken = None;
        self.catchup_target = None;
        self.set_state(SyncState::UpToDate);

        if let Some(storage) = self.storage.as_deref() {
            if let Some(tip) = storage.get_current_block_hash()? {
                self.tip_signal.notify(tip);
            }
        }

        // Spontaneous events received while catching up are re-evaluated in
        // arrival order; they may put us right back into catch-up.
        let mut pending = std::mem::take(&mut self.pending);
        while let Some(msg) = pending.pop_front() {
            if self.state != SyncState::UpToDate {
                // Another catch-up started; keep the remainder buffered,
                // ahead of anything the new catch-up has queued meanwhile.
                pending.extend(self.pending.drain(..));
                self.pending = pending;
                break;
            }
            match msg {
                ControllerMsg::Attach(block) => self.on_attach(block)?,
                ControllerMsg::Detach(block) => self.on_detach(block)?,
                other => {
                    debug!(?other, "dropping non-block message from pending queue");
                }
            }
        }
        Ok(())
    }

    /// Whether this block event belongs to the outstanding catch-up request.
    fn matches_reqtoken(&self, block: &BlockData) -> bool {
        match (&block.reqtoken, &self.reqtoken) {
            (Some(token), Some(current)) => token == current,
            _ => false,
        }
    }

    fn on_attach(&mut self, block: BlockData) -> GameResult<()> {
        counter!("xayagame_events_attach").increment(1);
        match self.state {
            SyncState::Stopped => Ok(()),
            SyncState::Unknown | SyncState::Disconnected => {
                // We cannot judge the event yet; the hello will pull in
                // whatever we miss here.
                debug!(hash = %block.hash, "attach before hello, reconnecting");
                self.connect()
            }
            SyncState::Pregenesis => {
                match self.genesis_height {
                    Some(genesis) if block.height >= genesis => self.resync(),
                    _ => Ok(()),
                }
            }
            SyncState::OutOfSync => self.resync(),
            SyncState::UpToDate => {
                if block.reqtoken.is_some() {
                    debug!(hash = %block.hash, "dropping stale tagged attach");
                    return Ok(());
                }
                let tip = self.current_tip()?;
                if Some(block.parent) == tip {
                    self.forward_step(block)
                } else {
                    // The node reorged or we missed events; not an error.
                    counter!("xayagame_reorgs").increment(1);
                    info!(
                        parent = %block.parent,
                        tip = ?tip,
                        "attach does not build on our tip, catching up"
                    );
                    let tip = tip.ok_or_else(|| {
                        GameError::Invariant("up-to-date without a stored tip".to_string())
                    })?;
                    self.set_state(SyncState::OutOfSync);
                    self.request_updates(tip)
                }
            }
            SyncState::CatchingUp => {
                if self.matches_reqtoken(&block) {
                    let tip = self.current_tip()?;
                    if Some(block.parent) == tip {
                        let hash = block.hash;
                        self.forward_step(block)?;
                        self.maybe_finish_catchup(hash)
                    } else {
                        // The backlog no longer lines up with our tip;
                        // restart from wherever we are.
                        let tip = tip.ok_or_else(|| {
                            GameError::Invariant("catching up without a stored tip".to_string())
                        })?;
                        self.request_updates(tip)
                    }
                } else if block.reqtoken.is_none() {
                    debug!(hash = %block.hash, "buffering spontaneous attach during catch-up");
                    self.pending.push_back(ControllerMsg::Attach(block));
                    Ok(())
                } else {
                    debug!(hash = %block.hash, "dropping attach with foreign reqtoken");
                    Ok(())
                }
            }
        }
    }

    fn on_detach(&mut self, block: BlockData) -> GameResult<()> {
        counter!("xayagame_events_detach").increment(1);
        match self.state {
            SyncState::Stopped | SyncState::Pregenesis => Ok(()),
            SyncState::Unknown | SyncState::Disconnected => self.connect(),
            SyncState::OutOfSync => self.resync(),
            SyncState::UpToDate => {
                if block.reqtoken.is_some() {
                    debug!(hash = %block.hash, "dropping stale tagged detach");
                    return Ok(());
                }
                let tip = self.current_tip()?;
                if Some(block.hash) == tip {
                    self.backward_step(block)
                } else {
                    let tip = tip.ok_or_else(|| {
                        GameError::Invariant("up-to-date without a stored tip".to_string())
                    })?;
                    info!(hash = %block.hash, %tip, "detach does not match our tip, catching up");
                    self.set_state(SyncState::OutOfSync);
                    self.request_updates(tip)
                }
            }
            SyncState::CatchingUp => {
                if self.matches_reqtoken(&block) {
                    let tip = self.current_tip()?;
                    if Some(block.hash) == tip {
                        self.backward_step(block)?;
                        let new_tip = self.current_tip()?.ok_or_else(|| {
                            GameError::Invariant("detached past the stored history".to_string())
                        })?;
                        self.maybe_finish_catchup(new_tip)
                    } else {
                        let tip = tip.ok_or_else(|| {
                            GameError::Invariant("catching up without a stored tip".to_string())
                        })?;
                        self.request_updates(tip)
                    }
                } else if block.reqtoken.is_none() {
                    self.pending.push_back(ControllerMsg::Detach(block));
                    Ok(())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// After applying a tagged event, check whether the backlog is done.
    fn maybe_finish_catchup(&mut self, reached: BlockHash) -> GameResult<()> {
        if self.catchup_target != Some(reached) {
            return Ok(());
        }
        let rpc = self
            .rpc
            .as_deref()
            .ok_or_else(|| GameError::Config("no node RPC configured".to_string()))?;
        let info = rpc.blockchain_info()?;
        if info.best_block_hash == reached {
            self.tip_height = Some(info.blocks);
            self.enter_up_to_date()
        } else {
            // The chain moved on while we were replaying; request the rest.
            self.request_updates(reached)
        }
    }

    fn current_tip(&self) -> GameResult<Option<BlockHash>> {
        let storage = self
            .storage
            .as_deref()
            .ok_or_else(|| GameError::Config("no storage configured".to_string()))?;
        Ok(storage.get_current_block_hash()?)
    }

    /// Record a rule failure; escalates to fatal after repeated failures on
    /// the same event.
    fn note_rule_failure(&mut self, hash: BlockHash, err: anyhow::Error) -> GameError {
        counter!("xayagame_rule_failures").increment(1);
        let count = match &mut self.failures {
            Some((failed, count)) if *failed == hash => {
                *count += 1;
                *count
            }
            _ => {
                self.failures = Some((hash, 1));
                1
            }
        };
        if count >= MAX_RULE_FAILURES {
            GameError::Invariant(format!(
                "rule failed {count} times in a row on block {hash}: {err:#}"
            ))
        } else {
            GameError::Rule(err)
        }
    }

    /// Apply one block on top of the current tip.
    fn forward_step(&mut self, block: BlockData) -> GameResult<()> {
        let storage = self
            .storage
            .as_deref_mut()
            .ok_or_else(|| GameError::Config("no storage configured".to_string()))?;
        let logic = self
            .logic
            .as_deref_mut()
            .ok_or_else(|| GameError::Config("no game logic configured".to_string()))?;

        self.txmgr.begin(storage)?;
        let old_state = storage.get_current_game_state()?;

        let (new_state, undo) = match logic.process_forward(&old_state, &block) {
            Ok(result) => result,
            Err(err) => {
                warn!(hash = %block.hash, error = %format!("{err:#}"), "forward step failed");
                self.txmgr.rollback(storage)?;
                return Err(self.note_rule_failure(block.hash, err));
            }
        };

        storage.add_undo_data(&block.hash, block.height, &undo)?;
        storage.set_current_game_state(&block.hash, &new_state)?;
        if let Some(pruning) = self.pruning.as_mut() {
            pruning.record(block.hash, block.height);
            pruning.prune(storage, block.height)?;
        }
        self.txmgr.maybe_commit(storage)?;

        self.failures = None;
        self.tip_height = Some(block.height);
        self.tip_signal.notify(block.hash);
        counter!("xayagame_blocks_attached").increment(1);
        debug!(hash = %block.hash, height = block.height, "attached block");
        Ok(())
    }

    /// Rewind the current tip using its stored undo data.
    fn backward_step(&mut self, block: BlockData) -> GameResult<()> {
        let storage = self
            .storage
            .as_deref_mut()
            .ok_or_else(|| GameError::Config("no storage configured".to_string()))?;
        let logic = self
            .logic
            .as_deref_mut()
            .ok_or_else(|| GameError::Config("no game logic configured".to_string()))?;

        self.txmgr.begin(storage)?;
        let Some(undo) = storage.get_undo_data(&block.hash)? else {
            // Pruned too far; only a full resync could recover, which would
            // silently rewrite history. Give up loudly instead.
            self.txmgr.rollback(storage)?;
            return Err(GameError::Invariant(format!(
                "no undo data for block {}, cannot rewind",
                block.hash
            )));
        };
        let old_state = storage.get_current_game_state()?;

        let new_state = match logic.process_backwards(&old_state, &block, &undo) {
            Ok(state) => state,
            Err(err) => {
                warn!(hash = %block.hash, error = %format!("{err:#}"), "backward step failed");
                self.txmgr.rollback(storage)?;
                return Err(self.note_rule_failure(block.hash, err));
            }
        };

        storage.set_current_game_state(&block.parent, &new_state)?;
        storage.release_undo_data(&block.hash)?;
        if let Some(pruning) = self.pruning.as_mut() {
            pruning.forget(block.height);
        }
        self.txmgr.maybe_commit(storage)?;

        self.failures = None;
        self.tip_height = block.height.checked_sub(1);
        self.tip_signal.notify(block.parent);
        counter!("xayagame_blocks_detached").increment(1);
        debug!(hash = %block.hash, parent = %block.parent, "detached block");
        Ok(())
    }

    fn on_stalled(&mut self) -> GameResult<()> {
        warn!("event stream stalled");
        if let Some(storage) = self.storage.as_deref_mut() {
            self.txmgr.flush(storage)?;
        }
        self.pending.clear();
        self.reqtoken = None;
        self.catchup_target = None;
        self.set_state(SyncState::Disconnected);
        Ok(())
    }

    fn on_desync(&mut self) -> GameResult<()> {
        match self.state {
            SyncState::UpToDate | SyncState::CatchingUp => {
                if let Some(tip) = self.current_tip()? {
                    warn!("event stream desynchronised, requesting updates");
                    self.request_updates(tip)
                } else {
                    self.resync()
                }
            }
            _ => Ok(()),
        }
    }

    /// Commit any open batch and stop.
    fn shutdown(&mut self) -> GameResult<()> {
        if let Some(storage) = self.storage.as_deref_mut() {
            // On a clean stop the open batch only contains successfully
            // applied steps (failures roll back immediately), so it commits.
            self.txmgr.flush(storage)?;
        }
        self.set_state(SyncState::Stopped);
        self.tip_signal.wake_all();
        info!("controller stopped");
        Ok(())
    }

    /// Stop after a fatal error: the open batch may contain a half-applied
    /// step, so it is rolled back instead of committed.
    fn abort(&mut self) {
        if let Some(storage) = self.storage.as_deref_mut() {
            if let Err(err) = self.txmgr.rollback(storage) {
                error!(error = %err, "rollback during abort failed");
            }
        }
        self.set_state(SyncState::Stopped);
        self.tip_signal.wake_all();
    }

    /// JSON for `getcurrentstate`.
    fn current_json_state(&self) -> GameResult<serde_json::Value> {
        let mut reply = self.null_json_state()?;

        let storage = self
            .storage
            .as_deref()
            .ok_or_else(|| GameError::Config("no storage configured".to_string()))?;
        let logic = self
            .logic
            .as_deref()
            .ok_or_else(|| GameError::Config("no game logic configured".to_string()))?;

        if storage.get_current_block_hash()?.is_some() {
            let state = storage.get_current_game_state()?;
            reply["gamestate"] = logic.game_state_to_json(&state).map_err(GameError::Rule)?;
        }
        Ok(reply)
    }

    /// JSON for `getnullstate`: everything but the game state itself.
    fn null_json_state(&self) -> GameResult<serde_json::Value> {
        let storage = self
            .storage
            .as_deref()
            .ok_or_else(|| GameError::Config("no storage configured".to_string()))?;

        let mut reply = json!({
            "gameid": self.game_id,
            "state": self.state.to_string(),
        });
        if let Some(chain) = self.chain {
            reply["chain"] = json!(chain.to_string());
        }
        if let Some(tip) = storage.get_current_block_hash()? {
            reply["blockhash"] = json!(tip.to_hex());
        }
        if let Some(height) = self.tip_height {
            reply["height"] = json!(height);
        }
        Ok(reply)
    }
}

/// Handle to a running (or to-be-run) game. Cheap to clone; all clones talk
/// to the same controller.
#[derive(Clone)]
pub struct Game {
    pub(crate) inner: Arc<GameInner>,
}

pub(crate) struct GameInner {
    game_id: String,
    pub(crate) core: RwLock<Core>,
    sender: Sender<ControllerMsg>,
    receiver: Mutex<Option<Receiver<ControllerMsg>>>,
    tip_signal: Arc<TipSignal>,
    stop_flag: Arc<AtomicBool>,
    event_timeout: Mutex<Duration>,
}

impl Game {
    pub fn new(game_id: impl Into<String>) -> Self {
        let game_id = game_id.into();
        let (sender, receiver) = unbounded();
        let tip_signal = Arc::new(TipSignal::new());
        Self {
            inner: Arc::new(GameInner {
                game_id: game_id.clone(),
                core: RwLock::new(Core::new(game_id, Arc::clone(&tip_signal))),
                sender,
                receiver: Mutex::new(Some(receiver)),
                tip_signal,
                stop_flag: Arc::new(AtomicBool::new(false)),
                event_timeout: Mutex::new(Duration::from_secs(60)),
            }),
        }
    }

    pub fn game_id(&self) -> &str {
        &self.inner.game_id
    }

    pub fn set_storage(&self, storage: Box<dyn StorageInterface>) {
        self.inner.core.write().storage = Some(storage);
    }

    pub fn set_game_logic(&self, mut logic: Box<dyn GameLogic>) {
        let mut core = self.inner.core.write();
        if let Some(chain) = core.chain {
            logic.set_chain(chain);
        }
        core.logic = Some(logic);
    }

    pub fn set_node_rpc(&self, rpc: Box<dyn NodeRpc>) {
        self.inner.core.write().rpc = Some(rpc);
    }

    /// Retain undo data for the last `keep` blocks only.
    pub fn enable_pruning(&self, keep: u64) {
        self.inner.core.write().pruning = Some(PruningQueue::new(keep));
    }

    /// Heartbeat timeout after which the event stream counts as stalled.
    pub fn set_event_timeout(&self, timeout: Duration) {
        *self.inner.event_timeout.lock() = timeout;
    }

    /// Discover the chain the node serves and pin it.
    pub fn detect_chain(&self) -> GameResult<ChainId> {
        let mut core = self.inner.core.write();
        let rpc = core
            .rpc
            .as_deref()
            .ok_or_else(|| GameError::Config("no node RPC configured".to_string()))?;
        let info = rpc.blockchain_info()?;
        let chain: ChainId = info.chain.parse()?;
        match core.chain {
            None => {
                core.chain = Some(chain);
                if let Some(logic) = core.logic.as_deref_mut() {
                    logic.set_chain(chain);
                }
            }
            Some(existing) if existing != chain => {
                return Err(GameError::Invariant(format!(
                    "node switched chains from {existing} to {chain}"
                )));
            }
            Some(_) => {}
        }
        Ok(chain)
    }

    /// The push-notification endpoint the node advertises for game blocks.
    pub fn detect_event_endpoint(&self) -> GameResult<Option<String>> {
        let core = self.inner.core.read();
        let rpc = core
            .rpc
            .as_deref()
            .ok_or_else(|| GameError::Config("no node RPC configured".to_string()))?;
        Ok(rpc
            .zmq_notifications()?
            .into_iter()
            .find(|n| n.notification_type == "pubgameblocks")
            .map(|n| n.address))
    }

    /// Current synchronisation state.
    pub fn state(&self) -> SyncState {
        self.inner.core.read().state()
    }

    /// Run the controller until [`Game::stop`] is called. Spawns the event
    /// thread around `transport` and processes messages on the calling
    /// thread.
    pub fn run(&self, transport: Box<dyn EventTransport>) -> GameResult<()> {
        let receiver = self
            .inner
            .receiver
            .lock()
            .take()
            .ok_or_else(|| GameError::Invariant("Game::run called twice".to_string()))?;

        let subscriber = Subscriber::new(
            transport,
            self.inner.game_id.clone(),
            self.inner.sender.clone(),
            Arc::clone(&self.inner.stop_flag),
            *self.inner.event_timeout.lock(),
        );
        let event_thread = thread::Builder::new()
            .name("xayagame-events".to_string())
            .spawn(move || subscriber.run())
            .map_err(|e| GameError::Transport(format!("failed to spawn event thread: {e}")))?;

        let result = self.writer_loop(&receiver);

        self.inner.stop_flag.store(true, Ordering::SeqCst);
        if event_thread.join().is_err() {
            error!("event thread panicked");
        }
        result
    }

    fn writer_loop(&self, receiver: &Receiver<ControllerMsg>) -> GameResult<()> {
        info!(game_id = %self.inner.game_id, "writer loop started");
        while let Ok(msg) = receiver.recv() {
            let result = self.inner.core.write().handle_message(msg);
            match result {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "recoverable error, continuing");
                }
                Err(err) => {
                    error!(error = %err, "fatal error, stopping");
                    self.inner.core.write().abort();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Request shutdown. Blocks only until the message is enqueued; `run`
    /// returns once the writer has drained.
    pub fn stop(&self) {
        self.inner.stop_flag.store(true, Ordering::SeqCst);
        let _ = self.inner.sender.send(ControllerMsg::Stop);
        self.inner.tip_signal.wake_all();
    }

    /// Reply for the `getcurrentstate` RPC.
    pub fn get_current_json_state(&self) -> GameResult<serde_json::Value> {
        self.inner.core.read().current_json_state()
    }

    /// Reply for the `getnullstate` RPC.
    pub fn get_null_json_state(&self) -> GameResult<serde_json::Value> {
        self.inner.core.read().null_json_state()
    }

    /// Block until the tip differs from `known` (or the timeout passes) and
    /// return the tip.
    pub fn wait_for_change(&self, known: Option<BlockHash>) -> BlockHash {
        self.inner
            .tip_signal
            .wait(known, WAIT_FOR_CHANGE_TIMEOUT)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use serde_json::Value;
    use std::sync::atomic::AtomicBool;
    use xayagame_store::{
        GameStateData,
        MemoryStorage,
        UndoData,
    };

    /// Chat-style rules over JSON bytes: moves overwrite per-user messages;
    /// undo data is the full previous state.
    struct ChatLogic {
        fail: Arc<AtomicBool>,
    }

    impl ChatLogic {
        fn apply_moves(state: &mut serde_json::Map<String, Value>, moves: &Value) {
            for entry in moves.as_array().unwrap() {
                let name = entry["name"].as_str().unwrap().to_string();
                for msg in entry["move"].as_array().unwrap() {
                    state.insert(name.clone(), msg.clone());
                }
            }
        }
    }

    impl GameLogic for ChatLogic {
        fn initial_state(&mut self) -> anyhow::Result<crate::logic::InitialState> {
            Ok(crate::logic::InitialState {
                height: 10,
                hash: Some(block_hash(10)),
                state: serde_json::to_vec(&json!({"domob": "hello world"}))?,
            })
        }

        fn process_forward(
            &mut self,
            old_state: &GameStateData,
            block: &BlockData,
        ) -> anyhow::Result<(GameStateData, UndoData)> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("induced failure");
            }
            let mut state: serde_json::Map<String, Value> = serde_json::from_slice(old_state)?;
            Self::apply_moves(&mut state, &block.moves);
            Ok((serde_json::to_vec(&state)?, old_state.clone()))
        }

        fn process_backwards(
            &mut self,
            _old_state: &GameStateData,
            _block: &BlockData,
            undo: &UndoData,
        ) -> anyhow::Result<GameStateData> {
            Ok(undo.clone())
        }
    }

    struct Fixture {
        game: Game,
        rpc: Arc<MockNodeRpc>,
        fail: Arc<AtomicBool>,
    }

    /// Adapter so the game can own a `Box<dyn NodeRpc>` while the test keeps
    /// a handle for scripting replies.
    struct SharedRpc(Arc<MockNodeRpc>);

    impl NodeRpc for SharedRpc {
        fn network_info(&self) -> crate::rpc::client::RpcResult<crate::rpc::client::NetworkInfo> {
            self.0.network_info()
        }
        fn blockchain_info(&self) -> crate::rpc::client::RpcResult<BlockchainInfo> {
            self.0.blockchain_info()
        }
        fn block_hash(&self, height: u64) -> crate::rpc::client::RpcResult<BlockHash> {
            self.0.block_hash(height)
        }
        fn send_updates(
            &self,
            from: &BlockHash,
            game_id: &str,
        ) -> crate::rpc::client::RpcResult<crate::rpc::client::GameUpdates> {
            self.0.send_updates(from, game_id)
        }
        fn zmq_notifications(
            &self,
        ) -> crate::rpc::client::RpcResult<Vec<crate::rpc::client::ZmqNotification>> {
            self.0.zmq_notifications()
        }
    }

    fn fixture() -> Fixture {
        let game = Game::new("chat");
        let fail = Arc::new(AtomicBool::new(false));
        let rpc = Arc::new(MockNodeRpc::new("regtest"));
        rpc.set_best(10, block_hash(10));

        game.set_storage(Box::new(MemoryStorage::new()));
        game.set_game_logic(Box::new(ChatLogic {
            fail: Arc::clone(&fail),
        }));
        game.set_node_rpc(Box::new(SharedRpc(Arc::clone(&rpc))));
        Fixture { game, rpc, fail }
    }

    fn up_to_date_fixture() -> Fixture {
        let fx = fixture();
        let state = serde_json::to_vec(&json!({"domob": "hello world"})).unwrap();
        fx.game.seed_state(block_hash(10), 10, &state);
        fx.game.force_state(SyncState::UpToDate);
        fx
    }

    fn state_json(game: &Game) -> Value {
        serde_json::from_slice(&game.storage_state()).unwrap()
    }

    fn attach(n: u8, moves: Value) -> BlockData {
        block_data(n, moves)
    }

    #[test]
    fn connect_initialises_genesis_state() {
        let fx = fixture();
        fx.game.inner.core.write().connect().unwrap();

        assert_eq!(fx.game.state(), SyncState::UpToDate);
        assert_eq!(fx.game.storage_tip(), Some(block_hash(10)));
        assert_eq!(state_json(&fx.game), json!({"domob": "hello world"}));
    }

    #[test]
    fn connect_below_genesis_is_pregenesis() {
        let fx = fixture();
        fx.rpc.set_best(5, block_hash(5));
        fx.game.inner.core.write().connect().unwrap();
        assert_eq!(fx.game.state(), SyncState::Pregenesis);
        assert!(fx.game.storage_tip().is_none());
    }

    #[test]
    fn connect_with_wrong_genesis_hash_is_fatal() {
        let fx = fixture();
        fx.rpc.set_best(10, block_hash(42));
        let err = fx.game.inner.core.write().connect().unwrap_err();
        assert!(matches!(err, GameError::Invariant(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn chain_mismatch_is_fatal() {
        let fx = fixture();
        fx.game.inner.core.write().connect().unwrap();
        *fx.rpc.chain.lock() = "main".to_string();
        let err = fx.game.inner.core.write().connect().unwrap_err();
        assert!(matches!(err, GameError::Invariant(_)));
    }

    #[test]
    fn forward_and_backward_steps() {
        let fx = up_to_date_fixture();

        fx.game
            .process_attach(attach(11, json!([{"name": "a", "move": ["x", "y"]}])))
            .unwrap();
        assert_eq!(
            state_json(&fx.game),
            json!({"domob": "hello world", "a": "y"})
        );
        assert_eq!(fx.game.storage_tip(), Some(block_hash(11)));

        fx.game
            .process_attach(attach(12, json!([{"name": "a", "move": ["z"]}])))
            .unwrap();
        assert_eq!(
            state_json(&fx.game),
            json!({"domob": "hello world", "a": "z"})
        );

        fx.game
            .process_detach(attach(12, json!([{"name": "a", "move": ["z"]}])))
            .unwrap();
        assert_eq!(
            state_json(&fx.game),
            json!({"domob": "hello world", "a": "y"})
        );

        fx.game
            .process_detach(attach(11, json!([{"name": "a", "move": ["x", "y"]}])))
            .unwrap();
        assert_eq!(state_json(&fx.game), json!({"domob": "hello world"}));
        assert_eq!(fx.game.storage_tip(), Some(block_hash(10)));
        assert_eq!(fx.game.state(), SyncState::UpToDate);
    }

    /// The same round trip on a durable backend.
    #[test]
    fn forward_and_backward_steps_on_sled() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fx = fixture();
        fx.game.set_storage(Box::new(
            xayagame_store::SledStorage::open(tmp.path().join("sled")).unwrap(),
        ));
        let state = serde_json::to_vec(&json!({"domob": "hello world"})).unwrap();
        fx.game.seed_state(block_hash(10), 10, &state);
        fx.game.force_state(SyncState::UpToDate);

        fx.game
            .process_attach(attach(11, json!([{"name": "a", "move": ["x"]}])))
            .unwrap();
        fx.game
            .process_attach(attach(12, json!([{"name": "b", "move": ["y"]}])))
            .unwrap();
        fx.game
            .process_detach(attach(12, json!([{"name": "b", "move": ["y"]}])))
            .unwrap();
        fx.game
            .process_detach(attach(11, json!([{"name": "a", "move": ["x"]}])))
            .unwrap();

        assert_eq!(state_json(&fx.game), json!({"domob": "hello world"}));
        assert_eq!(fx.game.storage_tip(), Some(block_hash(10)));
        assert_eq!(fx.game.state(), SyncState::UpToDate);
    }

    #[test]
    fn rule_failure_keeps_state_and_stays_up_to_date() {
        let fx = up_to_date_fixture();
        let before = state_json(&fx.game);

        fx.fail.store(true, Ordering::SeqCst);
        let err = fx
            .game
            .process_attach(attach(11, json!([{"name": "a", "move": ["x"]}])))
            .unwrap_err();
        assert!(matches!(err, GameError::Rule(_)));
        assert!(err.is_recoverable());

        assert_eq!(state_json(&fx.game), before);
        assert_eq!(fx.game.storage_tip(), Some(block_hash(10)));
        assert_eq!(fx.game.state(), SyncState::UpToDate);

        // Recovery works once the rule behaves again.
        fx.fail.store(false, Ordering::SeqCst);
        fx.game
            .process_attach(attach(11, json!([{"name": "a", "move": ["x"]}])))
            .unwrap();
        assert_eq!(fx.game.storage_tip(), Some(block_hash(11)));
    }

    #[test]
    fn repeated_rule_failures_escalate() {
        let fx = up_to_date_fixture();
        fx.fail.store(true, Ordering::SeqCst);

        for _ in 0..2 {
            let err = fx
                .game
                .process_attach(attach(11, json!([])))
                .unwrap_err();
            assert!(matches!(err, GameError::Rule(_)));
        }
        let err = fx.game.process_attach(attach(11, json!([]))).unwrap_err();
        assert!(matches!(err, GameError::Invariant(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn parent_mismatch_discards_and_catches_up() {
        let fx = up_to_date_fixture();
        fx.rpc.set_best(99, block_hash(99));
        *fx.rpc.to_block.lock() = block_hash(99);
        let before = state_json(&fx.game);

        let mut block = attach(100, json!([{"name": "a", "move": ["x"]}]));
        block.parent = block_hash(99);
        fx.game.process_attach(block).unwrap();

        // Storage untouched, controller catching up from our tip.
        assert_eq!(state_json(&fx.game), before);
        assert_eq!(fx.game.storage_tip(), Some(block_hash(10)));
        assert_eq!(fx.game.state(), SyncState::CatchingUp);
        assert_eq!(fx.rpc.update_calls.lock().as_slice(), &[block_hash(10)]);
    }

    #[test]
    fn catchup_applies_tagged_events_until_target() {
        let fx = up_to_date_fixture();

        // Node is two blocks ahead.
        fx.rpc.set_best(12, block_hash(12));
        *fx.rpc.to_block.lock() = block_hash(12);
        fx.game.inner.core.write().resync().unwrap();
        assert_eq!(fx.game.state(), SyncState::CatchingUp);

        // Foreign-token events are dropped.
        let mut foreign = attach(11, json!([]));
        foreign.reqtoken = Some("other".to_string());
        fx.game.process_attach(foreign).unwrap();
        assert_eq!(fx.game.storage_tip(), Some(block_hash(10)));

        // Tagged events advance the state.
        let mut first = attach(11, json!([{"name": "a", "move": ["x"]}]));
        first.reqtoken = Some("token".to_string());
        fx.game.process_attach(first).unwrap();
        assert_eq!(fx.game.state(), SyncState::CatchingUp);

        let mut second = attach(12, json!([{"name": "a", "move": ["y"]}]));
        second.reqtoken = Some("token".to_string());
        fx.game.process_attach(second).unwrap();

        assert_eq!(fx.game.state(), SyncState::UpToDate);
        assert_eq!(fx.game.storage_tip(), Some(block_hash(12)));
        assert_eq!(
            state_json(&fx.game),
            json!({"domob": "hello world", "a": "y"})
        );
    }

    #[test]
    fn untagged_events_buffer_during_catchup() {
        let fx = up_to_date_fixture();
        fx.rpc.set_best(11, block_hash(11));
        *fx.rpc.to_block.lock() = block_hash(11);
        fx.game.inner.core.write().resync().unwrap();
        assert_eq!(fx.game.state(), SyncState::CatchingUp);

        // A spontaneous attach for block 12 arrives mid-catch-up.
        fx.game
            .process_attach(attach(12, json!([{"name": "b", "move": ["later"]}])))
            .unwrap();
        assert_eq!(fx.game.storage_tip(), Some(block_hash(10)));

        // Catch-up completes; the buffered event is replayed on top.
        let mut tagged = attach(11, json!([{"name": "a", "move": ["x"]}]));
        tagged.reqtoken = Some("token".to_string());
        fx.game.process_attach(tagged).unwrap();

        assert_eq!(fx.game.state(), SyncState::UpToDate);
        assert_eq!(fx.game.storage_tip(), Some(block_hash(12)));
        assert_eq!(
            state_json(&fx.game),
            json!({"domob": "hello world", "a": "x", "b": "later"})
        );
    }

    #[test]
    fn detach_without_undo_is_fatal() {
        let fx = up_to_date_fixture();
        let err = fx
            .game
            .process_detach(attach(10, json!([])))
            .unwrap_err();
        assert!(matches!(err, GameError::Invariant(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn pruning_drops_old_undo_but_allows_one_detach() {
        let fx = up_to_date_fixture();
        fx.game.enable_pruning(0);

        fx.game
            .process_attach(attach(11, json!([{"name": "a", "move": ["x"]}])))
            .unwrap();
        fx.game
            .process_attach(attach(12, json!([{"name": "a", "move": ["y"]}])))
            .unwrap();

        // Undo for block 11 is pruned away; the tip's undo survives.
        {
            let core = fx.game.inner.core.read();
            let storage = core.storage.as_deref().unwrap();
            assert_eq!(storage.get_undo_data(&block_hash(11)).unwrap(), None);
            assert!(storage.get_undo_data(&block_hash(12)).unwrap().is_some());
        }

        fx.game
            .process_detach(attach(12, json!([{"name": "a", "move": ["y"]}])))
            .unwrap();
        assert_eq!(fx.game.storage_tip(), Some(block_hash(11)));

        // Going further back is impossible: fatal.
        let err = fx
            .game
            .process_detach(attach(11, json!([])))
            .unwrap_err();
        assert!(matches!(err, GameError::Invariant(_)));
    }

    #[test]
    fn stall_disconnects_and_reconnect_resyncs() {
        let fx = up_to_date_fixture();

        let mut core = fx.game.inner.core.write();
        assert!(core.handle_message(ControllerMsg::Stalled).unwrap());
        assert_eq!(core.state(), SyncState::Disconnected);

        // Reconnect runs the full hello again.
        assert!(core.handle_message(ControllerMsg::Connected).unwrap());
        assert_eq!(core.state(), SyncState::UpToDate);
    }

    #[test]
    fn stop_message_ends_the_loop() {
        let fx = up_to_date_fixture();
        let mut core = fx.game.inner.core.write();
        assert!(!core.handle_message(ControllerMsg::Stop).unwrap());
        assert_eq!(core.state(), SyncState::Stopped);
    }

    #[test]
    fn json_state_replies() {
        let fx = up_to_date_fixture();
        {
            // Chain is normally pinned during connect.
            fx.game.inner.core.write().chain = Some(ChainId::Regtest);
        }

        let null = fx.game.get_null_json_state().unwrap();
        assert_eq!(null["gameid"], "chat");
        assert_eq!(null["chain"], "regtest");
        assert_eq!(null["state"], "up to date");
        assert_eq!(null["blockhash"], block_hash(10).to_hex());
        assert_eq!(null["height"], 10);
        assert!(null.get("gamestate").is_none());

        let current = fx.game.get_current_json_state().unwrap();
        assert_eq!(current["gamestate"], json!({"domob": "hello world"}));
    }

    #[test]
    fn wait_for_change_returns_on_tip_update() {
        let fx = up_to_date_fixture();
        let game = fx.game.clone();

        let waiter = thread::spawn(move || game.wait_for_change(Some(block_hash(10))));
        // Give the waiter a moment to block, then attach.
        thread::sleep(Duration::from_millis(50));
        fx.game
            .process_attach(attach(11, json!([{"name": "a", "move": ["x"]}])))
            .unwrap();

        assert_eq!(waiter.join().unwrap(), block_hash(11));
    }

    #[test]
    fn detect_event_endpoint_finds_game_blocks() {
        let fx = fixture();
        assert_eq!(
            fx.game.detect_event_endpoint().unwrap().as_deref(),
            Some("tcp://127.0.0.1:28332")
        );
    }
}
