//! JSON-RPC client for the blockchain node.
//!
//! Only a handful of methods are consumed: `getnetworkinfo`,
//! `getblockchaininfo`, `getblockhash`, `game_sendupdates` and
//! `getzmqnotifications`. Idempotent reads are retried with exponential
//! backoff (50 ms doubling to 2 s, overall deadline 10 s); the backlog
//! request is not, since replaying it would spawn duplicate update streams.

use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::thread;
use std::time::{
    Duration,
    Instant,
};

use serde::Deserialize;
use serde_json::{
    Value,
    json,
};
use tracing::{
    debug,
    warn,
};
use xayagame_store::BlockHash;

#[derive(Debug, thiserror::Error)]
pub enum RpcClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),

    /// The node itself reported an error.
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },
}

pub type RpcResult<T> = Result<T, RpcClientError>;

/// Reply of `getnetworkinfo`, reduced to what the engine looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    pub version: u64,
    #[serde(default)]
    pub subversion: String,
}

/// Reply of `getblockchaininfo`, reduced to what the engine looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: BlockHash,
}

/// Reply of `game_sendupdates`: the token tagging the requested backlog and
/// the block the backlog ends at.
#[derive(Debug, Clone, Deserialize)]
pub struct GameUpdates {
    pub reqtoken: String,
    #[serde(rename = "toblock")]
    pub to_block: BlockHash,
    #[serde(default)]
    pub steps: UpdateSteps,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSteps {
    #[serde(default)]
    pub attach: u64,
    #[serde(default)]
    pub detach: u64,
}

/// One entry of `getzmqnotifications`.
#[derive(Debug, Clone, Deserialize)]
pub struct ZmqNotification {
    #[serde(rename = "type")]
    pub notification_type: String,
    pub address: String,
}

/// The node RPC methods the controller consumes. Mocked in tests.
pub trait NodeRpc: Send + Sync {
    fn network_info(&self) -> RpcResult<NetworkInfo>;
    fn blockchain_info(&self) -> RpcResult<BlockchainInfo>;
    fn block_hash(&self, height: u64) -> RpcResult<BlockHash>;
    fn send_updates(&self, from: &BlockHash, game_id: &str) -> RpcResult<GameUpdates>;
    fn zmq_notifications(&self) -> RpcResult<Vec<ZmqNotification>>;
}

const RETRY_INITIAL: Duration = Duration::from_millis(50);
const RETRY_MAX_STEP: Duration = Duration::from_secs(2);
const RETRY_DEADLINE: Duration = Duration::from_secs(10);

/// Blocking JSON-RPC-over-HTTP implementation of [`NodeRpc`].
pub struct HttpNodeRpc {
    client: reqwest::blocking::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpNodeRpc {
    pub fn new(url: impl Into<String>) -> RpcResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    fn call_once(&self, method: &str, params: Value) -> RpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "node RPC call");
        let reply: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()?
            .json()?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(RpcClientError::Node {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }

        reply
            .get("result")
            .cloned()
            .ok_or_else(|| RpcClientError::InvalidResponse("reply without result".to_string()))
    }

    /// Call an idempotent read, retrying transport failures with backoff.
    fn call_retrying(&self, method: &str, params: Value) -> RpcResult<Value> {
        let started = Instant::now();
        let mut delay = RETRY_INITIAL;
        loop {
            match self.call_once(method, params.clone()) {
                Ok(value) => return Ok(value),
                // Node-level errors are deterministic; retrying is pointless.
                Err(err @ RpcClientError::Node { .. }) => return Err(err),
                Err(err) => {
                    if started.elapsed() + delay > RETRY_DEADLINE {
                        return Err(err);
                    }
                    warn!(method, error = %err, delay_ms = delay.as_millis() as u64,
                          "node RPC failed, retrying");
                    thread::sleep(delay);
                    delay = (delay * 2).min(RETRY_MAX_STEP);
                }
            }
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(value: Value) -> RpcResult<T> {
        serde_json::from_value(value)
            .map_err(|e| RpcClientError::InvalidResponse(e.to_string()))
    }
}

impl NodeRpc for HttpNodeRpc {
    fn network_info(&self) -> RpcResult<NetworkInfo> {
        Self::parse(self.call_retrying("getnetworkinfo", json!([]))?)
    }

    fn blockchain_info(&self) -> RpcResult<BlockchainInfo> {
        Self::parse(self.call_retrying("getblockchaininfo", json!([]))?)
    }

    fn block_hash(&self, height: u64) -> RpcResult<BlockHash> {
        let value = self.call_retrying("getblockhash", json!([height]))?;
        let hex = value
            .as_str()
            .ok_or_else(|| RpcClientError::InvalidResponse("getblockhash: not a string".into()))?;
        BlockHash::from_hex(hex)
            .map_err(|_| RpcClientError::InvalidResponse(format!("bad block hash '{hex}'")))
    }

    fn send_updates(&self, from: &BlockHash, game_id: &str) -> RpcResult<GameUpdates> {
        Self::parse(self.call_once("game_sendupdates", json!([from.to_hex(), game_id]))?)
    }

    fn zmq_notifications(&self) -> RpcResult<Vec<ZmqNotification>> {
        Self::parse(self.call_retrying("getzmqnotifications", json!([]))?)
    }
}
