//! Channel-backed transport for tests.
//!
//! Instead of connecting to a real node, tests push [`RawEvent`]s into the
//! mock's sender half; the subscriber receives them exactly as it would
//! frames from a socket.

use std::time::Duration;

use crossbeam::channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
    unbounded,
};

use super::{
    EventTransport,
    RawEvent,
    TransportError,
};

/// Transport fed from a crossbeam channel.
pub struct MockTransport {
    sender: Sender<RawEvent>,
    receiver: Receiver<RawEvent>,
    /// Connect attempts left to fail, for reconnect tests.
    fail_connects: u32,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            fail_connects: 0,
        }
    }

    /// Handle tests use to inject frames.
    pub fn sender(&self) -> Sender<RawEvent> {
        self.sender.clone()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&mut self, n: u32) {
        self.fail_connects = n;
    }
}

impl EventTransport for MockTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<RawEvent>, TransportError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_injected_frames() {
        let mut transport = MockTransport::new();
        transport.connect().unwrap();

        let event = RawEvent {
            topic: "game-block-attach chat".to_string(),
            payload: b"{}".to_vec(),
            seq: Some(1),
        };
        transport.sender().send(event.clone()).unwrap();

        assert_eq!(
            transport.poll(Duration::from_millis(100)).unwrap(),
            Some(event)
        );
        assert_eq!(transport.poll(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn connect_failures_are_counted_down() {
        let mut transport = MockTransport::new();
        transport.fail_next_connects(2);
        assert!(transport.connect().is_err());
        assert!(transport.connect().is_err());
        assert!(transport.connect().is_ok());
    }
}
