//! Daemon configuration.
//!
//! Configuration comes from command-line flags (clap), optionally merged
//! over a JSON configuration file. The embedding application usually calls
//! [`DaemonArgs::parse`] and hands the resulting
//! [`GameDaemonConfiguration`] to [`crate::daemon::default_main`].

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{
    GameError,
    GameResult,
};

/// Which outward RPC server to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RpcServerType {
    None,
    Http,
    Tcp,
}

/// Storage engine for game states and undo data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    Sled,
    Sqlite,
}

/// Everything the daemon needs to run one game.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GameDaemonConfiguration {
    /// URL of the blockchain node's JSON-RPC endpoint.
    pub xaya_rpc_url: String,
    pub game_rpc_server: RpcServerType,
    pub game_rpc_port: u16,
    /// Root directory for on-disk storage; the actual data lives under
    /// `<data_directory>/<game_id>/<chain>/`.
    pub data_directory: PathBuf,
    pub storage_type: StorageType,
    /// Undo-history retention: negative keeps everything, zero keeps only
    /// the tip's undo record, N keeps the last N blocks.
    pub enable_pruning: i32,
    /// Silence on the event channel after which the stream counts as
    /// stalled.
    pub event_timeout_ms: u64,
}

impl Default for GameDaemonConfiguration {
    fn default() -> Self {
        Self {
            xaya_rpc_url: String::new(),
            game_rpc_server: RpcServerType::None,
            game_rpc_port: 0,
            data_directory: PathBuf::new(),
            storage_type: StorageType::Memory,
            enable_pruning: -1,
            event_timeout_ms: 60_000,
        }
    }
}

impl GameDaemonConfiguration {
    pub fn validate(&self) -> GameResult<()> {
        if self.xaya_rpc_url.is_empty() {
            return Err(GameError::Config("xaya_rpc_url must be set".to_string()));
        }
        if self.game_rpc_server != RpcServerType::None && self.game_rpc_port == 0 {
            return Err(GameError::Config(
                "game_rpc_port must be set when an RPC server is enabled".to_string(),
            ));
        }
        if self.storage_type != StorageType::Memory && self.data_directory.as_os_str().is_empty() {
            return Err(GameError::Config(
                "data_directory must be set for on-disk storage".to_string(),
            ));
        }
        if self.event_timeout_ms == 0 {
            return Err(GameError::Config(
                "event_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command-line surface of a game daemon.
#[derive(Debug, Parser)]
#[command(about = "Blockchain-driven game state daemon")]
pub struct DaemonArgs {
    /// JSON configuration file; flags override its values.
    #[arg(long, env = "GAME_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "XAYA_RPC_URL")]
    pub xaya_rpc_url: Option<String>,

    #[arg(long, value_enum)]
    pub game_rpc_server: Option<RpcServerType>,

    #[arg(long)]
    pub game_rpc_port: Option<u16>,

    #[arg(long)]
    pub data_directory: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub storage_type: Option<StorageType>,

    #[arg(long)]
    pub enable_pruning: Option<i32>,

    #[arg(long)]
    pub event_timeout_ms: Option<u64>,
}

impl DaemonArgs {
    /// Resolve the final configuration: file values first, flags on top.
    pub fn into_config(self) -> GameResult<GameDaemonConfiguration> {
        let mut config = match &self.config_file {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    GameError::Config(format!(
                        "cannot read config file {}: {e}",
                        path.display()
                    ))
                })?;
                serde_json::from_str(&text).map_err(|e| {
                    GameError::Config(format!(
                        "invalid config file {}: {e}",
                        path.display()
                    ))
                })?
            }
            None => GameDaemonConfiguration::default(),
        };

        if let Some(url) = self.xaya_rpc_url {
            config.xaya_rpc_url = url;
        }
        if let Some(server) = self.game_rpc_server {
            config.game_rpc_server = server;
        }
        if let Some(port) = self.game_rpc_port {
            config.game_rpc_port = port;
        }
        if let Some(dir) = self.data_directory {
            config.data_directory = dir;
        }
        if let Some(storage) = self.storage_type {
            config.storage_type = storage;
        }
        if let Some(pruning) = self.enable_pruning {
            config.enable_pruning = pruning;
        }
        if let Some(timeout) = self.event_timeout_ms {
            config.event_timeout_ms = timeout;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> GameDaemonConfiguration {
        GameDaemonConfiguration {
            xaya_rpc_url: "http://127.0.0.1:8396".to_string(),
            ..GameDaemonConfiguration::default()
        }
    }

    #[test]
    fn default_config_needs_rpc_url() {
        assert!(GameDaemonConfiguration::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn server_requires_port() {
        let mut config = valid();
        config.game_rpc_server = RpcServerType::Http;
        assert!(config.validate().is_err());
        config.game_rpc_port = 8399;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn disk_storage_requires_directory() {
        let mut config = valid();
        config.storage_type = StorageType::Sqlite;
        assert!(config.validate().is_err());
        config.data_directory = PathBuf::from("/tmp/games");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_file_with_flag_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "xaya_rpc_url": "http://127.0.0.1:8396",
                "storage_type": "sled",
                "data_directory": "/var/lib/game",
                "enable_pruning": 100
            }}"#
        )
        .unwrap();

        let args = DaemonArgs {
            config_file: Some(file.path().to_path_buf()),
            xaya_rpc_url: None,
            game_rpc_server: None,
            game_rpc_port: None,
            data_directory: None,
            storage_type: Some(StorageType::Sqlite),
            enable_pruning: None,
            event_timeout_ms: None,
        };

        let config = args.into_config().unwrap();
        assert_eq!(config.xaya_rpc_url, "http://127.0.0.1:8396");
        // The flag wins over the file.
        assert_eq!(config.storage_type, StorageType::Sqlite);
        assert_eq!(config.enable_pruning, 100);
        assert_eq!(config.data_directory, PathBuf::from("/var/lib/game"));
    }

    #[test]
    fn rejects_unknown_config_keys() {
        let result: Result<GameDaemonConfiguration, _> =
            serde_json::from_str(r#"{"no_such_option": true}"#);
        assert!(result.is_err());
    }
}
