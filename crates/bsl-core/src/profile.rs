//! Device profiles and lookup tables.
//!
//! Everything in here is read-only data describing MSP430 targets:
//!
//! - **Whole-image targets**: the custom Value Line BSL answers a probe byte
//!   with a reply that encodes the installed BSL variant and the start of
//!   MAIN memory. [`TargetModel`] selects the reply table.
//! - **ROM BSL targets**: the device-type bytes read from 0x0FF0 select a
//!   [`DeviceFamily`], which in turn selects the clock register values sent
//!   with the change-speed command.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Erased flash cell value.
pub const ERASED: u8 = 0xFF;

/// Highest address of the 16-bit address space (the reset vector's high byte).
pub const TOP_OF_MEMORY: u32 = 0xFFFF;

/// Which custom BSL is installed in a Value Line part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BslVariant {
    /// BSL lives entirely in INFO memory; the application starts at MAIN.
    Info,
    /// BSL occupies the first 0x60 bytes of MAIN plus INFOA-INFOC.
    Split,
    /// Early G2231 split BSL that only used 0x50 bytes of MAIN.
    LegacySplit,
}

impl BslVariant {
    /// Whether the application must start above the BSL's MAIN region.
    pub fn is_split(&self) -> bool {
        matches!(self, BslVariant::Split | BslVariant::LegacySplit)
    }
}

impl fmt::Display for BslVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BslVariant::Info => write!(f, "INFO"),
            BslVariant::Split => write!(f, "Split"),
            BslVariant::LegacySplit => write!(f, "Split (0x50)"),
        }
    }
}

/// Flash geometry of one target as seen by the image model.
///
/// MAIN memory runs from `main_start` up to 0xFFFF. The image buffer covers
/// that range, so `firmware_len() + 1` bytes are held and the reset vector
/// sits at the last two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub main_start: u16,
    pub split_size: u16,
}

impl DeviceProfile {
    /// MSP430G2231 with the original custom BSL (2K MAIN, 0x50 split region).
    pub const G2231: DeviceProfile = DeviceProfile::new(0xF800, 0x50);

    pub const fn new(main_start: u16, split_size: u16) -> Self {
        Self {
            main_start,
            split_size,
        }
    }

    /// Application entry point required by a split BSL.
    pub const fn split_start(&self) -> u16 {
        self.main_start + self.split_size
    }

    /// Index of the reset vector's high byte; also the number of bytes
    /// transmitted for an INFO layout image.
    pub const fn firmware_len(&self) -> usize {
        (TOP_OF_MEMORY - self.main_start as u32) as usize
    }

    /// Size of the MAIN memory buffer.
    pub const fn image_len(&self) -> usize {
        self.firmware_len() + 1
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MAIN=0x{:04X} split=0x{:04X} ({} bytes)",
            self.main_start,
            self.split_start(),
            self.image_len()
        )
    }
}

/// One row of a probe reply table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseEntry {
    pub reply: u8,
    pub variant: BslVariant,
    pub main_start: u16,
    pub split_size: u16,
}

impl ResponseEntry {
    const fn new(reply: u8, variant: BslVariant, main_start: u16, split_size: u16) -> Self {
        Self {
            reply,
            variant,
            main_start,
            split_size,
        }
    }
}

/// Result of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedBsl {
    pub variant: BslVariant,
    pub profile: DeviceProfile,
}

impl DetectedBsl {
    /// Address where the application's reset vector must point.
    pub fn app_start(&self) -> u16 {
        if self.variant.is_split() {
            self.profile.split_start()
        } else {
            self.profile.main_start
        }
    }
}

/// G2231 tool: ACK means INFO BSL, NACK means the 0x50 split BSL.
const G2231_RESPONSES: &[ResponseEntry] = &[
    ResponseEntry::new(0xF8, BslVariant::Info, 0xF800, 0x50),
    ResponseEntry::new(0xFE, BslVariant::LegacySplit, 0xF800, 0x50),
];

/// G2xx1/G2xx2 tool: the reply encodes variant and MAIN size (1K..8K).
const G2XX12_RESPONSES: &[ResponseEntry] = &[
    ResponseEntry::new(0xFF, BslVariant::Split, 0xFC00, 0x60),
    ResponseEntry::new(0x00, BslVariant::Split, 0xF800, 0x60),
    ResponseEntry::new(0xC0, BslVariant::Split, 0xF000, 0x60),
    ResponseEntry::new(0x80, BslVariant::Split, 0xE000, 0x60),
    ResponseEntry::new(0xFC, BslVariant::Info, 0xFC00, 0x60),
    ResponseEntry::new(0xF8, BslVariant::Info, 0xF800, 0x60),
    ResponseEntry::new(0xF0, BslVariant::Info, 0xF000, 0x60),
    ResponseEntry::new(0xE0, BslVariant::Info, 0xE000, 0x60),
    ResponseEntry::new(0xFE, BslVariant::LegacySplit, 0xF800, 0x50),
];

/// Custom BSL flavour targeted by the whole-image flasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetModel {
    /// Fixed 2K profile, reply only tells INFO from Split.
    G2231,
    /// Any G2xx1/G2xx2 part; geometry comes from the probe reply.
    #[default]
    G2xx12,
}

impl TargetModel {
    pub fn responses(&self) -> &'static [ResponseEntry] {
        match self {
            TargetModel::G2231 => G2231_RESPONSES,
            TargetModel::G2xx12 => G2XX12_RESPONSES,
        }
    }

    /// Profile known before talking to the device, if the model has one.
    pub fn fixed_profile(&self) -> Option<DeviceProfile> {
        match self {
            TargetModel::G2231 => Some(DeviceProfile::G2231),
            TargetModel::G2xx12 => None,
        }
    }

    /// Decode a probe reply. `None` means the reply is undetermined.
    pub fn lookup(&self, reply: u8) -> Option<DetectedBsl> {
        self.responses()
            .iter()
            .find(|entry| entry.reply == reply)
            .map(|entry| DetectedBsl {
                variant: entry.variant,
                profile: DeviceProfile::new(entry.main_start, entry.split_size),
            })
    }
}

impl fmt::Display for TargetModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetModel::G2231 => write!(f, "G2231"),
            TargetModel::G2xx12 => write!(f, "G2xx1/G2xx2"),
        }
    }
}

// ============================================================================
// ROM BSL device identification
// ============================================================================

/// Requested serial speed for the change-speed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Speed {
    Baud9600 = 0,
    Baud19200 = 1,
    Baud38400 = 2,
}

impl Speed {
    pub fn index(&self) -> u8 {
        *self as u8
    }

    pub fn baud_rate(&self) -> u32 {
        match self {
            Speed::Baud9600 => 9600,
            Speed::Baud19200 => 19200,
            Speed::Baud38400 => 38400,
        }
    }
}

impl TryFrom<u8> for Speed {
    type Error = String;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(Speed::Baud9600),
            1 => Ok(Speed::Baud19200),
            2 => Ok(Speed::Baud38400),
            other => Err(format!("speed index {} not in 0..=2", other)),
        }
    }
}

impl From<Speed> for u8 {
    fn from(speed: Speed) -> u8 {
        speed.index()
    }
}

/// Device family, keyed by the high byte of the device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// F1xx and F1232 (Basic Clock module).
    F1xx,
    /// F2xx and G2xx3 (Basic Clock+).
    F2xx,
    /// F4xx (FLL+).
    F4xx,
    Unknown(u8),
}

impl DeviceFamily {
    pub fn from_type_high(high: u8) -> Self {
        match high {
            0xF1 | 0x12 => DeviceFamily::F1xx,
            0xF2 | 0x25 => DeviceFamily::F2xx,
            0xF4 => DeviceFamily::F4xx,
            other => DeviceFamily::Unknown(other),
        }
    }

    /// Clock register values for `speed`, or `None` for unknown families.
    pub fn clock_setting(&self, speed: Speed) -> Option<ClockSetting> {
        CLOCK_TABLE
            .iter()
            .find(|row| row.family == *self && row.speed == speed)
            .map(|row| ClockSetting {
                baud_rate: speed.baud_rate(),
                reg_high: row.reg_high,
                reg_low: row.reg_low,
            })
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::F1xx => write!(f, "F1xx"),
            DeviceFamily::F2xx => write!(f, "F2xx"),
            DeviceFamily::F4xx => write!(f, "F4xx"),
            DeviceFamily::Unknown(hi) => write!(f, "unknown (0x{:02X})", hi),
        }
    }
}

/// Register pair sent with the change-speed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSetting {
    pub baud_rate: u32,
    /// BCSCTL1 (F1xx/F2xx) or SCFI1 (F4xx).
    pub reg_high: u8,
    /// DCOCTL (F1xx/F2xx) or SCFI0 (F4xx).
    pub reg_low: u8,
}

impl ClockSetting {
    /// Value carried in the frame's address field.
    pub fn register_word(&self) -> u16 {
        u16::from_be_bytes([self.reg_high, self.reg_low])
    }
}

struct ClockRow {
    family: DeviceFamily,
    speed: Speed,
    reg_high: u8,
    reg_low: u8,
}

const fn row(family: DeviceFamily, speed: Speed, reg_high: u8, reg_low: u8) -> ClockRow {
    ClockRow {
        family,
        speed,
        reg_high,
        reg_low,
    }
}

static CLOCK_TABLE: &[ClockRow] = &[
    // F148, F149, F169: Rsel / DCO
    row(DeviceFamily::F1xx, Speed::Baud9600, 0x85, 0x80),
    row(DeviceFamily::F1xx, Speed::Baud19200, 0x86, 0xE0),
    row(DeviceFamily::F1xx, Speed::Baud38400, 0x87, 0xE0),
    // F448, F449: NDCO / FN_x
    row(DeviceFamily::F4xx, Speed::Baud9600, 0x98, 0x00),
    row(DeviceFamily::F4xx, Speed::Baud19200, 0xB0, 0x00),
    row(DeviceFamily::F4xx, Speed::Baud38400, 0xC8, 0x00),
    row(DeviceFamily::F2xx, Speed::Baud9600, 0x88, 0x80),
    row(DeviceFamily::F2xx, Speed::Baud19200, 0x8B, 0x80),
    row(DeviceFamily::F2xx, Speed::Baud38400, 0x8C, 0x80),
];

/// Chip identification block read from 0x0FF0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub device_type: u16,
    pub process: u16,
    pub bsl_version: u16,
}

impl DeviceId {
    /// Number of bytes read from the ID block.
    pub const LEN: usize = 14;

    /// Parse the ID block. Returns `None` if fewer than 12 bytes are given.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < 12 {
            return None;
        }
        Some(Self {
            device_type: u16::from_be_bytes([block[0], block[1]]),
            process: u16::from_be_bytes([block[2], block[3]]),
            bsl_version: u16::from_be_bytes([block[10], block[11]]),
        })
    }

    pub fn family(&self) -> DeviceFamily {
        DeviceFamily::from_type_high((self.device_type >> 8) as u8)
    }

    /// ROM BSL versions up to 1.10 carry the checksum bug.
    pub fn has_checksum_bug(&self) -> bool {
        self.bsl_version <= 0x0110
    }

    /// From 1.40 on, the BSL verifies every programmed block itself.
    pub fn verifies_online(&self) -> bool {
        self.bsl_version >= 0x0140
    }

    /// RAM location where the BSL stores the last failing address.
    pub fn error_buffer(&self) -> u16 {
        if self.bsl_version < 0x0150 {
            0x021E
        } else {
            0x0200
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BSL version: {:X}.{:02X} - Family member: {:04X} - Process: {:04X}",
            self.bsl_version >> 8,
            self.bsl_version & 0xFF,
            self.device_type,
            self.process
        )
    }
}
