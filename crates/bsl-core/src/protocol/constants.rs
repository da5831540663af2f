//! Protocol constants for the MSP430 bootstrap loaders.
//!
//! Derived from the TI ROM BSL application note (SLAA089) and the custom
//! Value Line BSL wire format.

// ============================================================================
// ROM BSL command opcodes
// ============================================================================

pub const BSL_TX_PASSWORD: u8 = 0x10;
pub const BSL_TX_BLOCK: u8 = 0x12;
pub const BSL_RX_BLOCK: u8 = 0x14;
pub const BSL_ERASE_SEGMENT: u8 = 0x16;
pub const BSL_MASS_ERASE: u8 = 0x18;
pub const BSL_LOAD_PC: u8 = 0x1A;
pub const BSL_ERASE_CHECK: u8 = 0x1C;
/// Newer BSLs only; the ID block is read with RX_BLOCK instead.
pub const BSL_RX_ID: u8 = 0x1E;
pub const BSL_CHANGE_SPEED: u8 = 0x20;
pub const BSL_MEM_OFFSET: u8 = 0x21;

/// Mnemonic of a ROM BSL opcode, for logs.
pub fn command_name(opcode: u8) -> &'static str {
    match opcode {
        BSL_TX_PASSWORD => "TX_PASSWORD",
        BSL_TX_BLOCK => "TX_BLOCK",
        BSL_RX_BLOCK => "RX_BLOCK",
        BSL_ERASE_SEGMENT => "ERASE_SEGMENT",
        BSL_MASS_ERASE => "MASS_ERASE",
        BSL_LOAD_PC => "LOAD_PC",
        BSL_ERASE_CHECK => "ERASE_CHECK",
        BSL_RX_ID => "RX_ID",
        BSL_CHANGE_SPEED => "CHANGE_SPEED",
        BSL_MEM_OFFSET => "MEM_OFFSET",
        _ => "UNKNOWN",
    }
}

// ============================================================================
// ROM BSL framing bytes
// ============================================================================

/// Sync byte, also the header of every command and data frame.
pub const BSL_SYNC: u8 = 0x80;
pub const DATA_FRAME: u8 = 0x80;
pub const DATA_ACK: u8 = 0x90;
pub const DATA_NAK: u8 = 0xA0;

/// Largest payload the ROM BSL accepts in one frame.
pub const MAX_DATA_BYTES: usize = 250;
/// Default frame payload (largest multiple of 16 not above the limit).
pub const DEFAULT_DATA_BYTES: usize = 240;
pub const MIN_DATA_BYTES: usize = 16;

/// Header: sync, cmd, L1, L2, AL, AH, LL, LH.
pub const FRAME_HEADER_LEN: usize = 8;

// ============================================================================
// ROM BSL memory map and keys
// ============================================================================

pub const MASS_ERASE_ADDR: u16 = 0xFF00;
pub const MASS_ERASE_KEY: u16 = 0xA506;
pub const SEGMENT_ERASE_KEY: u16 = 0xA502;

pub const PASSWORD_ADDR: u16 = 0xFFE0;
pub const PASSWORD_LEN: usize = 0x20;

pub const DEVICE_ID_ADDR: u16 = 0x0FF0;

pub const INFO_A_ADDR: u16 = 0x10C0;
pub const INFO_A_LEN: usize = 0x40;

/// Below this address a buggy BSL may corrupt RAM or peripherals.
pub const BSL_CRITICAL_ADDR: u16 = 0x0A00;

/// Entry of the checksum-bug patch once loaded.
pub const PATCH_ENTRY_ADDR: u16 = 0x0220;
/// ROM BSL entry that resets the BSL stack before loading code.
pub const STACK_PREP_ADDR: u16 = 0x0C22;
/// Default RAM address of a replacement BSL.
pub const DEFAULT_RAM_BSL_ADDR: u16 = 0x0300;
/// Error address buffer of a LARGE memory model RAM BSL.
pub const LARGE_MODEL_ERROR_BUFFER: u16 = 0x0200;

// ============================================================================
// Value Line custom BSL
// ============================================================================

/// Byte sent to wake the BSL and learn its variant.
pub const VL_PROBE: u8 = 0xFE;
/// Starts the whole-image transfer.
pub const VL_COMMAND: u8 = 0xBA;
pub const VL_ACK: u8 = 0xF8;
pub const VL_NACK: u8 = 0xFE;

// ============================================================================
// Timing (milliseconds)
// ============================================================================

pub const SYNC_TIMEOUT_MS: u64 = 100;
pub const SYNC_ATTEMPTS: u32 = 3;
pub const REPLY_TIMEOUT_MS: u64 = 2000;
/// Settle time after the entry sequence and between line edges.
pub const RESET_SETTLE_MS: u64 = 250;
pub const RESET_PULSE_MS: u64 = 10;
/// Delay before the host switches baud after CHANGE_SPEED.
pub const BAUD_SWITCH_DELAY_MS: u64 = 10;

pub const VL_SYNC_TIMEOUT_MS: u64 = 1000;
pub const VL_PROBE_ATTEMPTS: u32 = 3;
pub const VL_COMMAND_DELAY_MS: u64 = 2000;
pub const VL_REPLY_TIMEOUT_MS: u64 = 2000;
