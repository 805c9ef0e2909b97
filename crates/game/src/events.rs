//! Typed block events and notification decoding.
//!
//! The node publishes JSON payloads on two topic prefixes,
//! `game-block-attach <gameId>` and `game-block-detach <gameId>`. This module
//! turns a raw (topic, payload) pair into a validated [`BlockData`]; anything
//! missing a required field is rejected as a malformed event.

use serde_json::Value;
use xayagame_store::BlockHash;

use crate::error::{
    GameError,
    GameResult,
};

pub const ATTACH_TOPIC_PREFIX: &str = "game-block-attach";
pub const DETACH_TOPIC_PREFIX: &str = "game-block-detach";

/// Whether a notification advances or rewinds the chain by one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Attach,
    Detach,
}

/// One block attach/detach notification, decoded and validated.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockData {
    pub hash: BlockHash,
    pub parent: BlockHash,
    pub height: u64,
    /// Correlator for replies to a backlog request, absent on spontaneous
    /// notifications.
    pub reqtoken: Option<String>,
    /// Block randomness seed forwarded untouched to the game rules.
    pub rngseed: Option<String>,
    pub timestamp: Option<i64>,
    /// Opaque JSON move list; only the game rules interpret it.
    pub moves: Value,
    /// Admin commands, only ever present on attach notifications.
    pub admin: Option<Value>,
}

/// A decoded notification: what happened, to which game.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
    pub kind: EventKind,
    pub game_id: String,
    pub block: BlockData,
}

/// Split a topic string into its event kind and game id.
pub fn parse_topic(topic: &str) -> Option<(EventKind, &str)> {
    if let Some(rest) = topic.strip_prefix(ATTACH_TOPIC_PREFIX) {
        return rest.strip_prefix(' ').map(|id| (EventKind::Attach, id));
    }
    if let Some(rest) = topic.strip_prefix(DETACH_TOPIC_PREFIX) {
        return rest.strip_prefix(' ').map(|id| (EventKind::Detach, id));
    }
    None
}

fn require<'a>(value: &'a Value, field: &str) -> GameResult<&'a Value> {
    value
        .get(field)
        .ok_or_else(|| GameError::MalformedEvent(format!("missing field '{field}'")))
}

fn require_hash(block: &Value, field: &str) -> GameResult<BlockHash> {
    let hex = require(block, field)?
        .as_str()
        .ok_or_else(|| GameError::MalformedEvent(format!("field '{field}' is not a string")))?;
    BlockHash::from_hex(hex)
        .map_err(|_| GameError::MalformedEvent(format!("field '{field}' is not a block hash")))
}

/// Decode and validate one notification payload.
pub fn decode_payload(kind: EventKind, payload: &[u8]) -> GameResult<BlockData> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| GameError::MalformedEvent(format!("invalid JSON: {e}")))?;

    let block = require(&value, "block")?;
    let hash = require_hash(block, "hash")?;
    let parent = require_hash(block, "parent")?;
    let height = require(block, "height")?
        .as_u64()
        .ok_or_else(|| GameError::MalformedEvent("field 'height' is not a u64".to_string()))?;

    let moves = require(&value, "moves")?;
    if !moves.is_array() {
        return Err(GameError::MalformedEvent(
            "field 'moves' is not an array".to_string(),
        ));
    }

    let admin = value.get("admin").cloned();
    if admin.is_some() && kind == EventKind::Detach {
        return Err(GameError::MalformedEvent(
            "detach notification carries admin commands".to_string(),
        ));
    }

    Ok(BlockData {
        hash,
        parent,
        height,
        reqtoken: value
            .get("reqtoken")
            .and_then(Value::as_str)
            .map(str::to_string),
        rngseed: block
            .get("rngseed")
            .and_then(Value::as_str)
            .map(str::to_string),
        timestamp: block.get("timestamp").and_then(Value::as_i64),
        moves: moves.clone(),
        admin,
    })
}
