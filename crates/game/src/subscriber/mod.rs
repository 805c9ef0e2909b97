//! # Event subscription
//!
//! The subscriber bridges the node's push channel and the controller. A
//! transport delivers raw `(topic, payload, seq)` frames; the subscriber
//! filters for this game's topics, decodes payloads and forwards typed
//! messages to the writer thread. It is entirely self-contained: the only
//! way it talks to the rest of the engine is the message sender handed to
//! it on creation.
//!
//! Failure handling:
//! - silence beyond the heartbeat timeout or a transport error marks the
//!   stream stalled and triggers a reconnect with exponential backoff
//!   (1 s doubling, capped at 30 s);
//! - malformed payloads and sequence-number gaps are reported as desyncs so
//!   the controller can re-request the backlog.

pub mod mock;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::thread;
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    controller::ControllerMsg,
    events::{
        self,
        EventKind,
    },
};

pub use mock::MockTransport;
pub use tcp::TcpTransport;

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// One raw notification frame as published by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Per-topic sequence number, when the channel provides one.
    pub seq: Option<u32>,
}

/// Abstraction over the push channel the node's notifications arrive on.
///
/// Implementations are blocking; the subscriber drives them from its own
/// thread. `poll` returns `Ok(None)` when the timeout passes without a
/// frame.
pub trait EventTransport: Send {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawEvent>, TransportError>;
    fn close(&mut self);
}

/// The event-thread service: connects, receives, decodes, enqueues.
pub(crate) struct Subscriber {
    transport: Box<dyn EventTransport>,
    game_id: String,
    sender: Sender<ControllerMsg>,
    stop: Arc<AtomicBool>,
    heartbeat: Duration,
    /// Last seen sequence number per topic.
    seq: HashMap<String, u32>,
}

impl Subscriber {
    pub(crate) fn new(
        transport: Box<dyn EventTransport>,
        game_id: String,
        sender: Sender<ControllerMsg>,
        stop: Arc<AtomicBool>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            transport,
            game_id,
            sender,
            stop,
            heartbeat,
            seq: HashMap::new(),
        }
    }

    /// Run until stopped. Never returns Err: all failures turn into
    /// reconnects or controller messages.
    pub(crate) fn run(mut self) {
        let mut backoff = BACKOFF_INITIAL;
        while !self.stop.load(Ordering::SeqCst) {
            match self.transport.connect() {
                Ok(()) => {
                    info!(game_id = %self.game_id, "event transport connected");
                    backoff = BACKOFF_INITIAL;
                    self.seq.clear();
                    if self.sender.send(ControllerMsg::Connected).is_err() {
                        break;
                    }
                    self.receive_until_stall();
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if self.sender.send(ControllerMsg::Stalled).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "event transport connect failed");
                }
            }

            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            debug!(delay_ms = backoff.as_millis() as u64, "reconnect backoff");
            thread::sleep(backoff);
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }

        self.transport.close();
        debug!("event thread exiting");
    }

    /// Inner receive loop; returns when the stream stalls or errors.
    fn receive_until_stall(&mut self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            match self.transport.poll(self.heartbeat) {
                Ok(Some(raw)) => {
                    if !self.handle_frame(raw) {
                        return;
                    }
                }
                Ok(None) => {
                    warn!(
                        timeout_ms = self.heartbeat.as_millis() as u64,
                        "no events within heartbeat timeout"
                    );
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "event transport receive failed");
                    return;
                }
            }
        }
    }

    /// Decode one frame. Returns `false` when the controller is gone.
    fn handle_frame(&mut self, raw: RawEvent) -> bool {
        let Some((kind, game_id)) = events::parse_topic(&raw.topic) else {
            debug!(topic = %raw.topic, "ignoring frame on unknown topic");
            return true;
        };
        if game_id != self.game_id {
            return true;
        }

        if let Some(seq) = raw.seq {
            let expected = self.seq.get(&raw.topic).map(|last| last + 1);
            self.seq.insert(raw.topic.clone(), seq);
            if let Some(expected) = expected {
                if seq != expected {
                    warn!(
                        topic = %raw.topic,
                        expected,
                        got = seq,
                        "sequence number gap, forcing resync"
                    );
                    return self.sender.send(ControllerMsg::Desync).is_ok();
                }
            }
        }

        match events::decode_payload(kind, &raw.payload) {
            Ok(block) => {
                let msg = match kind {
                    EventKind::Attach => ControllerMsg::Attach(block),
                    EventKind::Detach => ControllerMsg::Detach(block),
                };
                self.sender.send(msg).is_ok()
            }
            Err(err) => {
                warn!(error = %err, "discarding malformed event");
                self.sender.send(ControllerMsg::Desync).is_ok()
            }
        }
    }
}
