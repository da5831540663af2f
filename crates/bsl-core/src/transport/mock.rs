//! Mock serial transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{BslTransport, TransportError};
use crate::protocol::constants::{DATA_ACK, DATA_FRAME, DATA_NAK};
use crate::protocol::frame::checksum;

/// Modem line and configuration changes, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Reset(bool),
    Test(bool),
    Baud(u32),
    Purge,
    Restore,
}

#[derive(Debug)]
struct MockState {
    replies: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    lines: Vec<LineEvent>,
    baud: u32,
    initial_baud: u32,
    connected: bool,
    restored: bool,
}

/// Mock transport for protocol and session tests.
///
/// Replies are a scripted byte stream; clones share the same state so a
/// test can keep a handle after moving the transport into a session.
/// `purge()` is recorded but leaves the script intact.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_baud(9600)
    }

    pub fn with_baud(baud: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                replies: VecDeque::new(),
                writes: Vec::new(),
                lines: Vec::new(),
                baud,
                initial_baud: baud,
                connected: true,
                restored: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue raw bytes to be returned by subsequent reads.
    pub fn queue_reply(&self, bytes: &[u8]) {
        self.state().replies.extend(bytes.iter().copied());
    }

    pub fn queue_ack(&self) {
        self.queue_reply(&[DATA_ACK]);
    }

    pub fn queue_nak(&self) {
        self.queue_reply(&[DATA_NAK]);
    }

    /// Queue a well-formed ROM BSL data frame carrying `data`.
    pub fn queue_data_frame(&self, data: &[u8]) {
        let mut frame = vec![DATA_FRAME, 0x00, data.len() as u8, data.len() as u8];
        frame.extend_from_slice(data);
        let ck = checksum(&frame);
        frame.extend_from_slice(&ck.to_le_bytes());
        self.queue_reply(&frame);
    }

    /// Sync ACK followed by an ACK for the command itself.
    pub fn queue_command_ack(&self) {
        self.queue_ack();
        self.queue_ack();
    }

    pub fn pending_replies(&self) -> usize {
        self.state().replies.len()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// Captured writes that are command frames (sync bytes dropped).
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.get_writes().into_iter().filter(|w| w.len() > 1).collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    pub fn line_events(&self) -> Vec<LineEvent> {
        self.state().lines.clone()
    }

    pub fn was_restored(&self) -> bool {
        self.state().restored
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.state().connected = true;
    }

    fn check_connected(state: &MockState) -> Result<(), TransportError> {
        if state.connected {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BslTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        state.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        let n = buf.len().min(state.replies.len());
        for (slot, byte) in buf.iter_mut().zip(state.replies.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        Self::check_connected(&state)?;
        state.lines.push(LineEvent::Purge);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.state().baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        let mut state = self.state();
        state.baud = baud;
        state.lines.push(LineEvent::Baud(baud));
        Ok(())
    }

    fn set_reset_line(&mut self, level: bool) -> Result<(), TransportError> {
        self.state().lines.push(LineEvent::Reset(level));
        Ok(())
    }

    fn set_test_line(&mut self, level: bool) -> Result<(), TransportError> {
        self.state().lines.push(LineEvent::Test(level));
        Ok(())
    }

    fn restore(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.baud = state.initial_baud;
        state.restored = true;
        state.lines.push(LineEvent::Restore);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reply_queue() {
        let mut mock = MockTransport::new();
        mock.queue_reply(&[1, 2, 3]);
        assert_eq!(mock.pending_replies(), 3);

        let mut buf = [0u8; 2];
        assert_eq!(mock.read(&mut buf, Duration::ZERO).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(mock.read(&mut buf, Duration::ZERO).unwrap(), 1);
        assert_eq!(buf[0], 3);

        // Queue is empty now
        assert_eq!(mock.read(&mut buf, Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::new();
        mock.write(b"Hello").unwrap();
        mock.write(b"W").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(mock.frames().len(), 1);

        mock.clear_writes();
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_mock_shared_handles() {
        let handle = MockTransport::new();
        let mut moved = handle.clone();
        moved.set_baud_rate(38400).unwrap();
        assert_eq!(handle.baud_rate(), 38400);

        moved.restore().unwrap();
        assert!(handle.was_restored());
        assert_eq!(handle.baud_rate(), 9600);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(
            mock.write(b"test"),
            Err(TransportError::Disconnected)
        ));
        mock.reconnect();
        assert!(mock.write(b"test").is_ok());
    }
}
