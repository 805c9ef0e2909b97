//! Error taxonomy of the game engine.
//!
//! The kinds mirror how the engine recovers: transport problems and rule
//! failures are handled locally (reconnect / rollback), everything else is
//! fatal and terminates the daemon with a diagnostic.

use xayagame_store::StorageError;

use crate::rpc::client::RpcClientError;

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    /// Configuration missing or contradictory. Fatal before start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Node RPC or event-channel I/O. Recovered by reconnect and backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// An event notification is missing required fields. The event is
    /// discarded and the controller resynchronises.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The user rule failed during a forward or backward step. The enclosing
    /// transaction is rolled back and the prior state kept.
    #[error("game rule failed: {0:#}")]
    Rule(#[source] anyhow::Error),

    /// Node RPC reported an error or returned garbage.
    #[error(transparent)]
    NodeRpc(#[from] RpcClientError),

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Checksums or invariants violated inside a backend. Fatal.
    #[error("storage corruption: {0}")]
    Corruption(String),

    /// Undo data required but missing, chain-id mismatch, impossible state
    /// transition. Fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type GameResult<T> = Result<T, GameError>;

impl GameError {
    /// Whether the engine may keep running after observing this error.
    /// Only transport problems and rule failures recover locally; a storage
    /// failure mid-step leaves no safe state to continue from.
    pub fn is_recoverable(&self) -> bool {
        match self {
            GameError::Transport(_)
            | GameError::MalformedEvent(_)
            | GameError::Rule(_)
            | GameError::NodeRpc(_) => true,
            GameError::Config(_)
            | GameError::Corruption(_)
            | GameError::Invariant(_)
            | GameError::Storage(_) => false,
        }
    }
}
