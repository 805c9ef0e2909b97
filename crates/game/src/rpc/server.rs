//! JSON-RPC server exposing the game state.
//!
//! Methods: `getcurrentstate`, `getnullstate`, `waitforchange`, `stop`.
//! Served either over HTTP (axum) or as newline-delimited JSON-RPC on a
//! plain TCP socket; both share one dispatch function. `waitforchange`
//! blocks up to five seconds, so dispatch always runs on a blocking thread.

use axum::{
    Router,
    extract::{
        Json,
        State,
    },
    routing::post,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    Value,
    json,
};
use tokio::io::{
    AsyncBufReadExt,
    AsyncWriteExt,
    BufReader,
};
use tokio::net::TcpListener;
use tracing::{
    debug,
    info,
};
use xayagame_store::BlockHash;

use crate::{
    controller::Game,
    error::{
        GameError,
        GameResult,
    },
};

const JSONRPC_VERSION: &str = "2.0";

const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;
const PARSE_ERROR: i32 = -32700;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

/// Extract the `waitforchange` argument: a known block hash, positionally
/// or as `{"knownblock": "..."}`.
fn known_block_param(params: Option<&Value>) -> Result<Option<BlockHash>, String> {
    let value = match params {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    let hex = match value {
        Value::Array(items) => match items.first() {
            None => return Ok(None),
            Some(Value::String(s)) => s,
            Some(_) => return Err("known block must be a hex string".to_string()),
        },
        Value::Object(map) => match map.get("knownblock") {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) => s,
            Some(_) => return Err("known block must be a hex string".to_string()),
        },
        _ => return Err("parameters must be an array or object".to_string()),
    };
    BlockHash::from_hex(hex)
        .map(Some)
        .map_err(|_| format!("invalid block hash '{hex}'"))
}

/// Handle one request. Blocking: `waitforchange` sleeps on the tip signal.
pub fn dispatch(game: &Game, request: &JsonRpcRequest) -> JsonRpcResponse {
    debug!(method = %request.method, "game RPC request");
    let id = request.id.clone();
    match request.method.as_str() {
        "getcurrentstate" => match game.get_current_json_state() {
            Ok(state) => JsonRpcResponse::success(id, state),
            Err(err) => JsonRpcResponse::error(id, INTERNAL_ERROR, err.to_string()),
        },
        "getnullstate" => match game.get_null_json_state() {
            Ok(state) => JsonRpcResponse::success(id, state),
            Err(err) => JsonRpcResponse::error(id, INTERNAL_ERROR, err.to_string()),
        },
        "waitforchange" => match known_block_param(request.params.as_ref()) {
            Ok(known) => {
                let tip = game.wait_for_change(known);
                let result = if tip.is_null() {
                    json!({})
                } else {
                    json!({"blockhash": tip.to_hex()})
                };
                JsonRpcResponse::success(id, result)
            }
            Err(message) => JsonRpcResponse::error(id, INVALID_PARAMS, message),
        },
        "stop" => {
            info!("stop requested via RPC");
            game.stop();
            JsonRpcResponse::success(id, Value::Null)
        }
        _ => JsonRpcResponse::error(id, METHOD_NOT_FOUND, "Method not found"),
    }
}

async fn dispatch_blocking(game: Game, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    tokio::task::spawn_blocking(move || dispatch(&game, &request))
        .await
        .unwrap_or_else(|_| JsonRpcResponse::error(id, INTERNAL_ERROR, "handler panicked"))
}

async fn http_handler(
    State(game): State<Game>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    Json(dispatch_blocking(game, request).await)
}

/// The HTTP router, exposed separately for tests.
pub fn router(game: Game) -> Router {
    Router::new().route("/", post(http_handler)).with_state(game)
}

/// Serve JSON-RPC over HTTP on localhost until the task is dropped.
pub async fn serve_http(port: u16, game: Game) -> GameResult<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| GameError::Config(format!("cannot bind RPC port {port}: {e}")))?;
    info!(port, "game RPC server listening (http)");
    axum::serve(listener, router(game))
        .await
        .map_err(|e| GameError::Transport(format!("RPC server failed: {e}")))
}

/// Serve newline-delimited JSON-RPC on a localhost TCP socket.
pub async fn serve_tcp(port: u16, game: Game) -> GameResult<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| GameError::Config(format!("cannot bind RPC port {port}: {e}")))?;
    info!(port, "game RPC server listening (tcp)");

    loop {
        let (socket, peer) = listener
            .accept()
            .await
            .map_err(|e| GameError::Transport(format!("RPC accept failed: {e}")))?;
        debug!(%peer, "RPC client connected");
        let game = game.clone();

        tokio::spawn(async move {
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
                    Ok(request) => dispatch_blocking(game.clone(), request).await,
                    Err(err) => {
                        JsonRpcResponse::error(None, PARSE_ERROR, err.to_string())
                    }
                };
                let Ok(mut bytes) = serde_json::to_vec(&response) else {
                    break;
                };
                bytes.push(b'\n');
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            debug!(%peer, "RPC client disconnected");
        });
    }
}
