//! Synchronised request/reply exchange with the ROM BSL.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::constants::*;
use super::frame::{DataFrameError, Frame, decode_data_frame};
use crate::transport::{BslTransport, TransportError};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("BSL did not answer sync after {attempts} attempts")]
    SyncFailed { attempts: u32 },

    #[error("Command 0x{opcode:02X} rejected by BSL (NAK)")]
    Nak { opcode: u8 },

    #[error("Timeout after {timeout_ms}ms waiting for BSL reply")]
    Timeout { timeout_ms: u64 },

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<DataFrameError> for ProtocolError {
    fn from(e: DataFrameError) -> Self {
        let msg = match e {
            DataFrameError::BadHeader(b) => format!("bad data frame header 0x{:02X}", b),
            DataFrameError::LengthMismatch { l1, l2 } => {
                format!("data frame length mismatch (L1={}, L2={})", l1, l2)
            }
            DataFrameError::Checksum { expected, actual } => format!(
                "data frame checksum 0x{:04X}, expected 0x{:04X}",
                actual, expected
            ),
            DataFrameError::Truncated => "truncated data frame".to_string(),
        };
        ProtocolError::CommunicationError(msg)
    }
}

/// Decoded reply to a command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Data(Vec<u8>),
}

/// Timeouts and retry limits for the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    pub sync_timeout: Duration,
    pub sync_attempts: u32,
    pub reply_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_millis(SYNC_TIMEOUT_MS),
            sync_attempts: SYNC_ATTEMPTS,
            reply_timeout: Duration::from_millis(REPLY_TIMEOUT_MS),
        }
    }
}

/// Read one byte, `None` on timeout.
pub fn read_byte<T: BslTransport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
) -> Result<Option<u8>, TransportError> {
    let mut buf = [0u8; 1];
    match transport.read(&mut buf, timeout)? {
        0 => Ok(None),
        _ => Ok(Some(buf[0])),
    }
}

/// Fill `buf` completely, looping over partial reads until `timeout`.
pub fn read_exact<T: BslTransport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = transport.read(&mut buf[filled..], remaining)?;
        if n == 0 {
            return Err(ProtocolError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Send the sync byte until the BSL acknowledges it.
pub fn sync<T: BslTransport + ?Sized>(
    transport: &mut T,
    timeout: Duration,
    attempts: u32,
) -> Result<(), ProtocolError> {
    for attempt in 1..=attempts {
        transport.purge()?;
        transport.write_all(&[BSL_SYNC])?;
        match read_byte(transport, timeout)? {
            Some(DATA_ACK) => {
                trace!(attempt, "Sync OK");
                return Ok(());
            }
            Some(other) => debug!(attempt, "Sync answered with 0x{:02X}", other),
            None => debug!(attempt, "Sync timed out"),
        }
    }
    Err(ProtocolError::SyncFailed { attempts })
}

/// Command channel to a ROM BSL.
pub struct BslLink<T: BslTransport> {
    transport: T,
    timing: LinkTiming,
    checksum_bug_warning: bool,
}

impl<T: BslTransport> BslLink<T> {
    pub fn new(transport: T, timing: LinkTiming) -> Self {
        Self {
            transport,
            timing,
            checksum_bug_warning: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn timing(&self) -> &LinkTiming {
        &self.timing
    }

    /// Warn about frames whose checksum makes a buggy BSL write low RAM.
    pub fn set_checksum_bug_warning(&mut self, enabled: bool) {
        self.checksum_bug_warning = enabled;
    }

    pub fn sync(&mut self) -> Result<(), ProtocolError> {
        sync(
            &mut self.transport,
            self.timing.sync_timeout,
            self.timing.sync_attempts,
        )
    }

    /// Sync, send `frame` and decode the reply.
    pub fn transceive(&mut self, frame: &Frame) -> Result<Reply, ProtocolError> {
        self.sync()?;

        if self.checksum_bug_warning {
            let access = frame.bug_access_address();
            if access < BSL_CRITICAL_ADDR {
                warn!(
                    "This command might change data at address 0x{:04X} or 0x{:04X}",
                    access,
                    access + 1
                );
            }
        }

        let wire = frame.encode();
        trace!(
            cmd = command_name(frame.opcode()),
            len = wire.len(),
            "TX frame"
        );
        self.transport.write_all(&wire)?;
        self.read_reply(frame.opcode())
    }

    /// Like [`transceive`](Self::transceive) but requires a plain ACK.
    pub fn execute(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        match self.transceive(frame)? {
            Reply::Ack => Ok(()),
            Reply::Data(_) => Err(ProtocolError::CommunicationError(format!(
                "unexpected data reply to command 0x{:02X}",
                frame.opcode()
            ))),
        }
    }

    /// Read `len` bytes starting at `address`, hiding the even alignment.
    pub fn read_block(&mut self, address: u16, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let frame = Frame::block_read(address, len as u16);
        let data = match self.transceive(&frame)? {
            Reply::Data(data) => data,
            Reply::Ack => {
                return Err(ProtocolError::CommunicationError(
                    "expected data frame, got ACK".to_string(),
                ));
            }
        };

        let skew = Frame::read_skew(address);
        if data.len() < skew + len {
            return Err(ProtocolError::CommunicationError(format!(
                "short read at 0x{:04X}: {} of {} bytes",
                address,
                data.len().saturating_sub(skew),
                len
            )));
        }
        Ok(data[skew..skew + len].to_vec())
    }

    fn read_reply(&mut self, opcode: u8) -> Result<Reply, ProtocolError> {
        let timeout = self.timing.reply_timeout;
        let first = read_byte(&mut self.transport, timeout)?.ok_or(ProtocolError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })?;

        match first {
            DATA_ACK => Ok(Reply::Ack),
            DATA_NAK => {
                debug!(cmd = command_name(opcode), "NAK");
                Err(ProtocolError::Nak { opcode })
            }
            DATA_FRAME => {
                let mut head = [0u8; 3];
                read_exact(&mut self.transport, &mut head, timeout)?;
                let (l1, l2) = (head[1], head[2]);
                if l1 != l2 {
                    return Err(DataFrameError::LengthMismatch { l1, l2 }.into());
                }

                let mut frame = Vec::with_capacity(4 + l1 as usize + 2);
                frame.push(first);
                frame.extend_from_slice(&head);
                frame.resize(4 + l1 as usize + 2, 0);
                read_exact(&mut self.transport, &mut frame[4..], timeout)?;

                Ok(Reply::Data(decode_data_frame(&frame)?))
            }
            other => Err(ProtocolError::CommunicationError(format!(
                "unexpected reply byte 0x{:02X}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn fast_timing() -> LinkTiming {
        LinkTiming {
            sync_timeout: Duration::from_millis(1),
            sync_attempts: 3,
            reply_timeout: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_sync_retries_then_fails() {
        let mock = MockTransport::new();
        let mut link = BslLink::new(mock.clone(), fast_timing());

        let err = link.sync().unwrap_err();
        assert!(matches!(err, ProtocolError::SyncFailed { attempts: 3 }));
        assert_eq!(mock.get_writes(), vec![vec![0x80]; 3]);
    }

    #[test]
    fn test_sync_skips_garbage() {
        let mock = MockTransport::new();
        mock.queue_reply(&[0x00]);
        mock.queue_ack();
        let mut link = BslLink::new(mock.clone(), fast_timing());

        link.sync().unwrap();
        assert_eq!(mock.get_writes().len(), 2);
    }

    #[test]
    fn test_execute_ack_and_nak() {
        let mock = MockTransport::new();
        mock.queue_command_ack();
        mock.queue_ack();
        mock.queue_nak();
        let mut link = BslLink::new(mock.clone(), fast_timing());

        link.execute(&Frame::command(BSL_LOAD_PC, 0x0220, 0)).unwrap();
        let err = link.execute(&Frame::erased_password()).unwrap_err();
        assert!(matches!(err, ProtocolError::Nak { opcode: 0x10 }));
    }

    #[test]
    fn test_command_names() {
        assert_eq!(command_name(BSL_TX_PASSWORD), "TX_PASSWORD");
        assert_eq!(command_name(BSL_RX_ID), "RX_ID");
        assert_eq!(command_name(BSL_MEM_OFFSET), "MEM_OFFSET");
        assert_eq!(command_name(0x42), "UNKNOWN");
    }

    #[test]
    fn test_read_block_strips_alignment() {
        let mock = MockTransport::new();
        mock.queue_ack();
        mock.queue_data_frame(&[0xAA, 0x11, 0x22, 0x33]);
        let mut link = BslLink::new(mock.clone(), fast_timing());

        let data = link.read_block(0x1001, 3).unwrap();
        assert_eq!(data, vec![0x11, 0x22, 0x33]);

        let frame = &mock.frames()[0];
        assert_eq!(&frame[4..8], &[0x00, 0x10, 0x04, 0x00]);
    }

    #[test]
    fn test_reply_timeout() {
        let mock = MockTransport::new();
        mock.queue_ack();
        let mut link = BslLink::new(mock, fast_timing());

        let err = link.read_block(0x0FF0, 14).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
    }

    #[test]
    fn test_truncated_data_frame_times_out() {
        let mock = MockTransport::new();
        mock.queue_ack();
        mock.queue_reply(&[0x80, 0x00, 0x04, 0x04, 0x01]);
        let mut link = BslLink::new(mock, fast_timing());

        assert!(matches!(
            link.read_block(0x1000, 4),
            Err(ProtocolError::Timeout { .. })
        ));
    }

    #[test]
    fn test_unexpected_reply() {
        let mock = MockTransport::new();
        mock.queue_ack();
        mock.queue_reply(&[0x42]);
        let mut link = BslLink::new(mock, fast_timing());

        assert!(matches!(
            link.execute(&Frame::command(BSL_MASS_ERASE, MASS_ERASE_ADDR, MASS_ERASE_KEY)),
            Err(ProtocolError::CommunicationError(_))
        ));
    }
}
