//! Daemon assembly: storage selection, wiring and the blocking main loop.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{
    info,
    warn,
};
use xayagame_store::{
    MemoryStorage,
    SledStorage,
    SqliteStorage,
    StorageInterface,
};

use crate::{
    chain::ChainId,
    config::{
        GameDaemonConfiguration,
        RpcServerType,
        StorageType,
    },
    controller::Game,
    error::{
        GameError,
        GameResult,
    },
    logic::GameLogic,
    rpc::{
        client::HttpNodeRpc,
        server,
    },
    subscriber::EventTransport,
};

/// Install a formatted `tracing` subscriber honouring `RUST_LOG`. Safe to
/// call more than once; later calls are no-ops.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Build the storage backend the configuration selects, rooted at
/// `<data_directory>/<game_id>/<chain>/`.
pub fn create_storage(
    config: &GameDaemonConfiguration,
    game_id: &str,
    chain: ChainId,
) -> GameResult<Box<dyn StorageInterface>> {
    if config.storage_type == StorageType::Memory {
        return Ok(Box::new(MemoryStorage::new()));
    }

    let game_dir: PathBuf = config
        .data_directory
        .join(game_id)
        .join(chain.as_str());
    if game_dir.is_dir() {
        info!(dir = %game_dir.display(), "using existing data directory");
    } else {
        info!(dir = %game_dir.display(), "creating data directory");
        fs::create_dir_all(&game_dir)
            .map_err(|e| GameError::Config(format!("cannot create {}: {e}", game_dir.display())))?;
    }

    match config.storage_type {
        StorageType::Memory => unreachable!("handled above"),
        StorageType::Sled => {
            let dir = game_dir.join("sled");
            Ok(Box::new(SledStorage::open(dir)?))
        }
        StorageType::Sqlite => {
            let file = game_dir.join("storage.sqlite");
            Ok(Box::new(SqliteStorage::open(file)?))
        }
    }
}

/// Run one game daemon to completion: wire everything per the
/// configuration, block until `stop()` (RPC or Ctrl-C), tear down.
pub fn default_main(
    config: &GameDaemonConfiguration,
    game_id: &str,
    logic: Box<dyn GameLogic>,
    transport: Box<dyn EventTransport>,
) -> GameResult<()> {
    init_logging();
    config.validate()?;

    let game = Game::new(game_id);
    game.set_node_rpc(Box::new(HttpNodeRpc::new(config.xaya_rpc_url.clone())?));

    let chain = game.detect_chain()?;
    info!(game_id, %chain, "starting game daemon");

    game.set_storage(create_storage(config, game_id, chain)?);
    game.set_game_logic(logic);
    game.set_event_timeout(Duration::from_millis(config.event_timeout_ms));
    if let Ok(keep) = u64::try_from(config.enable_pruning) {
        game.enable_pruning(keep);
    }

    if let Some(endpoint) = game.detect_event_endpoint()? {
        info!(endpoint, "node advertises game-block notifications");
    } else {
        warn!("node does not advertise game-block notifications");
    }

    // The RPC server needs an async runtime; the controller itself stays on
    // plain threads.
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| GameError::Config(format!("cannot start async runtime: {e}")))?;
    match config.game_rpc_server {
        RpcServerType::None => {
            warn!("no game RPC server configured, state is only observable via logs");
        }
        RpcServerType::Http => {
            let port = config.game_rpc_port;
            let game = game.clone();
            runtime.spawn(async move {
                if let Err(err) = server::serve_http(port, game).await {
                    warn!(error = %err, "game RPC server exited");
                }
            });
        }
        RpcServerType::Tcp => {
            let port = config.game_rpc_port;
            let game = game.clone();
            runtime.spawn(async move {
                if let Err(err) = server::serve_tcp(port, game).await {
                    warn!(error = %err, "game RPC server exited");
                }
            });
        }
    }

    let ctrlc_game = game.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, stopping");
        ctrlc_game.stop();
    })
    .map_err(|e| GameError::Config(format!("cannot install signal handler: {e}")))?;

    let result = game.run(transport);

    // Stop serving RPC before the game handle goes away.
    runtime.shutdown_background();
    info!("game daemon finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with(storage_type: StorageType, dir: &TempDir) -> GameDaemonConfiguration {
        GameDaemonConfiguration {
            xaya_rpc_url: "http://127.0.0.1:8396".to_string(),
            storage_type,
            data_directory: dir.path().to_path_buf(),
            ..GameDaemonConfiguration::default()
        }
    }

    #[test]
    fn memory_storage_needs_no_directory() {
        let config = GameDaemonConfiguration {
            xaya_rpc_url: "http://127.0.0.1:8396".to_string(),
            ..GameDaemonConfiguration::default()
        };
        assert!(create_storage(&config, "chat", ChainId::Regtest).is_ok());
    }

    #[test]
    fn sled_storage_creates_chain_scoped_directory() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(StorageType::Sled, &tmp);
        let storage = create_storage(&config, "chat", ChainId::Regtest).unwrap();
        drop(storage);
        assert!(tmp.path().join("chat").join("regtest").join("sled").is_dir());
    }

    #[test]
    fn sqlite_storage_creates_database_file() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(StorageType::Sqlite, &tmp);
        let storage = create_storage(&config, "chat", ChainId::Main).unwrap();
        drop(storage);
        assert!(tmp
            .path()
            .join("chat")
            .join("main")
            .join("storage.sqlite")
            .is_file());
    }

    #[test]
    fn chains_get_separate_directories() {
        let tmp = TempDir::new().unwrap();
        let config = config_with(StorageType::Sqlite, &tmp);
        create_storage(&config, "chat", ChainId::Main).unwrap();
        create_storage(&config, "chat", ChainId::Test).unwrap();
        assert!(tmp.path().join("chat").join("main").is_dir());
        assert!(tmp.path().join("chat").join("test").is_dir());
    }
}
