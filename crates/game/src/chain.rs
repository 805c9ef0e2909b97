//! Chain identification.

use std::fmt;
use std::str::FromStr;

use crate::error::GameError;

/// The network a node is serving.
///
/// Discovered once from `getblockchaininfo` and pinned for the lifetime of
/// the controller; a later mismatch is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainId {
    Main,
    Test,
    Regtest,
}

impl ChainId {
    /// Short name used in data-directory layouts and JSON replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Main => "main",
            ChainId::Test => "test",
            ChainId::Regtest => "regtest",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(ChainId::Main),
            "test" => Ok(ChainId::Test),
            "regtest" => Ok(ChainId::Regtest),
            other => Err(GameError::Config(format!("unknown chain '{other}'"))),
        }
    }
}
