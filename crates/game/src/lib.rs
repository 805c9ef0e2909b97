//! # `xayagame`
//!
//! A library for building blockchain-driven, deterministic and replayable
//! game daemons. Embedders supply the game rules (as a [`GameLogic`]
//! implementation, plain callbacks, or SQL-backed [`SqliteGameLogic`]); the
//! library supplies everything around them:
//!
//! - connection to the blockchain node (JSON-RPC hello, backlog requests,
//!   push notifications for block attach/detach);
//! - durable storage of game states keyed by block hash, with per-block
//!   undo data so chain reorganisations roll the state backward correctly;
//! - a controller that keeps storage consistent with exactly one chain tip
//!   through any ordering of notifications and failures;
//! - an outward JSON-RPC surface for reading the current state.
//!
//! ```no_run
//! use xayagame::{
//!     config::DaemonArgs,
//!     daemon,
//!     subscriber::TcpTransport,
//! };
//! use clap::Parser;
//!
//! # fn rules() -> Box<dyn xayagame::logic::GameLogic> { unimplemented!() }
//! fn main() -> anyhow::Result<()> {
//!     let config = DaemonArgs::parse().into_config()?;
//!     let transport = Box::new(TcpTransport::new("tcp://127.0.0.1:28332"));
//!     daemon::default_main(&config, "mygame", rules(), transport)?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod batch;
pub mod chain;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod events;
pub mod logic;
pub mod pruning;
pub mod rpc;
pub mod sqlite_game;
pub mod subscriber;

pub use chain::ChainId;
pub use controller::{
    Game,
    SyncState,
};
pub use error::{
    GameError,
    GameResult,
};
pub use events::BlockData;
pub use logic::{
    CallbackGameLogic,
    GameLogic,
    GameLogicCallbacks,
    InitialState,
};
pub use sqlite_game::{
    SqliteGame,
    SqliteGameContext,
    SqliteGameLogic,
};
pub use xayagame_store::{
    BlockHash,
    GameStateData,
    UndoData,
};
