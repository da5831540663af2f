//! Memory-backed ROM BSL simulator for session tests.
//!
//! Answers sync bytes and decodes command frames against a sparse memory
//! map. Flash above 0x1000 behaves like NOR flash: writes can only clear
//! bits and erases set whole segments back to 0xFF.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use super::mock::LineEvent;
use super::traits::{BslTransport, TransportError};
use crate::profile::ERASED;
use crate::protocol::constants::*;
use crate::protocol::frame::checksum;

const FLASH_START: u32 = 0x1000;
const INFO_END: u32 = 0x1100;
const INFO_SEGMENT: u32 = 0x40;
const MAIN_SEGMENT: u32 = 0x200;

/// One decoded command as seen by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimCommand {
    pub opcode: u8,
    pub address: u16,
    pub length: u16,
}

#[derive(Debug)]
struct SimState {
    memory: HashMap<u32, u8>,
    output: VecDeque<u8>,
    commands: Vec<SimCommand>,
    lines: Vec<LineEvent>,
    locked: bool,
    offset: u16,
    baud: u32,
    initial_baud: u32,
    restored: bool,
    mute: bool,
    reject_speed: bool,
    fail_write_at: Option<u32>,
    error_buffer: u16,
}

impl SimState {
    fn peek(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(ERASED)
    }

    fn absolute(&self, address: u16) -> u32 {
        ((self.offset as u32) << 16) | address as u32
    }

    fn program(&mut self, address: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let at = address + i as u32;
            let value = if at >= FLASH_START {
                self.peek(at) & byte
            } else {
                byte
            };
            self.memory.insert(at, value);
        }
    }

    fn erase_range(&mut self, start: u32, end: u32) {
        self.memory.retain(|&a, _| a < start || a >= end);
    }

    fn reply_data(&mut self, data: &[u8]) {
        let mut frame = vec![DATA_FRAME, 0x00, data.len() as u8, data.len() as u8];
        frame.extend_from_slice(data);
        let ck = checksum(&frame);
        frame.extend_from_slice(&ck.to_le_bytes());
        self.output.extend(frame);
    }

    fn ack(&mut self, ok: bool) {
        self.output.push_back(if ok { DATA_ACK } else { DATA_NAK });
    }

    fn handle_frame(&mut self, wire: &[u8]) {
        if wire.len() < FRAME_HEADER_LEN + 2 || wire[2] != wire[3] {
            self.ack(false);
            return;
        }
        let end = wire.len() - 2;
        if checksum(&wire[..end]) != LittleEndian::read_u16(&wire[end..]) {
            self.ack(false);
            return;
        }

        let cmd = SimCommand {
            opcode: wire[1],
            address: LittleEndian::read_u16(&wire[4..6]),
            length: LittleEndian::read_u16(&wire[6..8]),
        };
        let payload = &wire[FRAME_HEADER_LEN..end];
        self.commands.push(cmd);

        match cmd.opcode {
            BSL_TX_PASSWORD => {
                let expected: Vec<u8> = (0..payload.len() as u32)
                    .map(|i| self.peek(cmd.address as u32 + i))
                    .collect();
                let ok = expected == payload;
                if ok {
                    self.locked = false;
                }
                self.ack(ok);
            }
            BSL_MASS_ERASE => {
                self.erase_range(FLASH_START, 0x1_0000);
                self.ack(true);
            }
            BSL_CHANGE_SPEED => {
                let ok = !self.locked && !self.reject_speed;
                self.ack(ok);
            }
            BSL_MEM_OFFSET => {
                self.offset = cmd.length;
                self.ack(true);
            }
            _ if self.locked => self.ack(false),
            BSL_TX_BLOCK => {
                let start = self.absolute(cmd.address);
                let end = start + payload.len() as u32;
                match self.fail_write_at {
                    Some(bad) if (start..end).contains(&bad) => {
                        let reported = (bad as u16).wrapping_add(3);
                        let buffer = self.error_buffer as u32;
                        self.memory.insert(buffer, reported as u8);
                        self.memory.insert(buffer + 1, (reported >> 8) as u8);
                        self.ack(false);
                    }
                    _ => {
                        self.program(start, payload);
                        self.ack(true);
                    }
                }
            }
            BSL_RX_BLOCK => {
                let start = self.absolute(cmd.address);
                let data: Vec<u8> = (0..cmd.length as u32).map(|i| self.peek(start + i)).collect();
                self.reply_data(&data);
            }
            BSL_ERASE_CHECK => {
                let start = self.absolute(cmd.address);
                let ok = (0..cmd.length as u32).all(|i| self.peek(start + i) == ERASED);
                self.ack(ok);
            }
            BSL_ERASE_SEGMENT => {
                let at = self.absolute(cmd.address);
                let size = if at < INFO_END { INFO_SEGMENT } else { MAIN_SEGMENT };
                let start = at - at % size;
                self.erase_range(start, start + size);
                self.ack(true);
            }
            BSL_LOAD_PC => {
                if cmd.address == STACK_PREP_ADDR {
                    self.locked = true;
                }
                self.ack(true);
            }
            _ => self.ack(false),
        }
    }
}

/// Simulated ROM BSL reachable through [`BslTransport`].
///
/// Clones share state, so a test keeps a handle after lending the
/// transport to a session.
#[derive(Debug, Clone)]
pub struct SimTarget {
    state: Arc<Mutex<SimState>>,
}

impl SimTarget {
    /// Target with the given ID block; interrupt vectors erased.
    pub fn new(device_type: u16, bsl_version: u16) -> Self {
        let sim = Self {
            state: Arc::new(Mutex::new(SimState {
                memory: HashMap::new(),
                output: VecDeque::new(),
                commands: Vec::new(),
                lines: Vec::new(),
                locked: true,
                offset: 0,
                baud: 9600,
                initial_baud: 9600,
                restored: false,
                mute: false,
                reject_speed: false,
                fail_write_at: None,
                error_buffer: if bsl_version < 0x0150 { 0x021E } else { 0x0200 },
            })),
        };
        let mut id = [0u8; 16];
        id[0..2].copy_from_slice(&device_type.to_be_bytes());
        id[10..12].copy_from_slice(&bsl_version.to_be_bytes());
        sim.load(DEVICE_ID_ADDR as u32, &id);
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store bytes directly, bypassing flash semantics.
    pub fn load(&self, address: u32, bytes: &[u8]) {
        let mut state = self.state();
        for (i, &b) in bytes.iter().enumerate() {
            state.memory.insert(address + i as u32, b);
        }
    }

    pub fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.state();
        (0..len as u32).map(|i| state.peek(address + i)).collect()
    }

    /// As if the application had already unlocked and started the BSL.
    pub fn unlock(&self) {
        self.state().locked = false;
    }

    /// Stop answering entirely.
    pub fn mute(&self) {
        self.state().mute = true;
    }

    pub fn reject_speed_change(&self) {
        self.state().reject_speed = true;
    }

    /// NAK the block write covering `address` and record it in the error
    /// buffer.
    pub fn fail_write_at(&self, address: u32) {
        self.state().fail_write_at = Some(address);
    }

    pub fn set_error_buffer(&self, address: u16) {
        self.state().error_buffer = address;
    }

    pub fn commands(&self) -> Vec<SimCommand> {
        self.state().commands.clone()
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.commands().iter().map(|c| c.opcode).collect()
    }

    pub fn line_events(&self) -> Vec<LineEvent> {
        self.state().lines.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn offset(&self) -> u16 {
        self.state().offset
    }

    pub fn was_restored(&self) -> bool {
        self.state().restored
    }
}

impl BslTransport for SimTarget {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state();
        if state.mute {
            return Ok(data.len());
        }
        match data {
            [BSL_SYNC] => state.output.push_back(DATA_ACK),
            _ => state.handle_frame(data),
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state();
        let n = buf.len().min(state.output.len());
        for (slot, byte) in buf.iter_mut().zip(state.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.output.clear();
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
        let mut state = self.state();
        if !level {
            // Reset locks the BSL and drops the memory offset.
            state.locked = true;
            state.offset = 0;
        }
        state.lines.push(LineEvent::Reset(level));
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

/// Write `contents` to a per-process scratch file and return its path.
pub fn scratch_file(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bsl-core-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BslLink, Frame, LinkTiming, ProtocolError};

    fn link(sim: &SimTarget) -> BslLink<SimTarget> {
        BslLink::new(
            sim.clone(),
            LinkTiming {
                sync_timeout: Duration::from_millis(1),
                sync_attempts: 2,
                reply_timeout: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_locked_until_password() {
        let sim = SimTarget::new(0xF149, 0x0130);
        let mut link = link(&sim);

        let err = link.read_block(0x0FF0, 2).unwrap_err();
        assert!(matches!(err, ProtocolError::Nak { .. }));

        link.execute(&Frame::erased_password()).unwrap();
        assert_eq!(link.read_block(0x0FF0, 2).unwrap(), vec![0xF1, 0x49]);
    }

    #[test]
    fn test_flash_write_clears_bits_only() {
        let sim = SimTarget::new(0xF149, 0x0130);
        let mut link = link(&sim);
        link.execute(&Frame::erased_password()).unwrap();

        link.execute(&Frame::block_write(0x2000, &[0x0F, 0xF0])).unwrap();
        link.execute(&Frame::block_write(0x2000, &[0xFF, 0x00])).unwrap();
        assert_eq!(sim.read(0x2000, 2), vec![0x0F, 0x00]);

        link.execute(&Frame::command(BSL_ERASE_SEGMENT, 0x2010, SEGMENT_ERASE_KEY))
            .unwrap();
        assert_eq!(sim.read(0x2000, 2), vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_mute_target_fails_sync() {
        let sim = SimTarget::new(0xF149, 0x0130);
        sim.mute();
        let err = link(&sim).sync().unwrap_err();
        assert!(matches!(err, ProtocolError::SyncFailed { attempts: 2 }));
    }
}
