//! TCP transport for the node's push channel.
//!
//! The node advertises its notification endpoint via `getzmqnotifications`
//! as an address of the form `tcp://host:port`. Frames are newline-delimited
//! JSON objects:
//!
//! ```text
//! {"topic": "game-block-attach chat", "payload": {...}, "seq": 17}
//! ```
//!
//! The socket uses a short read timeout so `poll` can honour its deadline
//! and the stop flag stays responsive.

use std::io::{
    BufRead,
    BufReader,
    ErrorKind,
};
use std::net::TcpStream;
use std::time::{
    Duration,
    Instant,
};

use serde::Deserialize;
use tracing::debug;

use super::{
    EventTransport,
    RawEvent,
    TransportError,
};

/// Per-read socket timeout; `poll` loops reads until its own deadline.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Deserialize)]
struct Frame {
    topic: String,
    payload: serde_json::Value,
    #[serde(default)]
    seq: Option<u32>,
}

/// Line-framed TCP implementation of [`EventTransport`].
pub struct TcpTransport {
    address: String,
    reader: Option<BufReader<TcpStream>>,
    /// Partial line carried across read timeouts.
    line: String,
}

impl TcpTransport {
    /// `address` accepts `host:port` or `tcp://host:port`.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let address = address
            .strip_prefix("tcp://")
            .map_or_else(|| address.clone(), str::to_string);
        Self {
            address,
            reader: None,
            line: String::new(),
        }
    }

    fn parse_line(line: &str) -> Result<RawEvent, TransportError> {
        let frame: Frame = serde_json::from_str(line)
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        Ok(RawEvent {
            topic: frame.topic,
            payload: serde_json::to_vec(&frame.payload)
                .map_err(|e| TransportError::InvalidFrame(e.to_string()))?,
            seq: frame.seq,
        })
    }
}

impl EventTransport for TcpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.address)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        debug!(address = %self.address, "connected event socket");
        self.reader = Some(BufReader::new(stream));
        self.line.clear();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<RawEvent>, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        let deadline = Instant::now() + timeout;

        loop {
            // read_line only returns Ok at a newline or at EOF; a timeout
            // mid-frame leaves the partial line buffered for the next call.
            match reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.reader = None;
                    return Err(TransportError::Closed);
                }
                Ok(_) => {
                    let result = {
                        let trimmed = self.line.trim();
                        if trimmed.is_empty() {
                            None
                        } else {
                            Some(Self::parse_line(trimmed))
                        }
                    };
                    self.line.clear();
                    match result {
                        Some(event) => return Ok(Some(event?)),
                        None => continue,
                    }
                }
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(err) => {
                    self.reader = None;
                    return Err(TransportError::Io(err));
                }
            }
        }
    }

    fn close(&mut self) {
        self.reader = None;
    }
}
