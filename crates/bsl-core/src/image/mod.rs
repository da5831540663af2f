//! Firmware image model.
//!
//! [`FirmwareFile`] is the sparse, file-order view used by the incremental
//! ROM BSL session. [`MemoryImage`] is the dense MAIN memory buffer used by
//! the whole-image flasher: it tracks an XOR checksum on every write and is
//! turned into a [`FinalizedImage`] ready to be streamed to the device.

pub mod records;
pub mod titxt;

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::profile::{DeviceProfile, ERASED};

pub use records::{Blocks, FirmwareFile, Segment, parse_str};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Cannot open {path}: {source}")]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed record on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("Address 0x{address:04X} is below MAIN memory start 0x{origin:04X}")]
    AddressBelowOrigin { address: u32, origin: u16 },
    #[error("Address 0x{address:X} is outside the 16-bit address space")]
    AddressOutOfRange { address: u32 },
    #[error(
        "Reset vector 0x{found:04X} must point to 0x{main_start:04X} (INFO) or 0x{split_start:04X} (Split)"
    )]
    InvalidResetVector {
        found: u16,
        main_start: u16,
        split_start: u16,
    },
    #[error("No code at reset vector target 0x{address:04X}")]
    NoCodeAtResetVector { address: u16 },
    #[error("Split layout has data at 0x{address:04X}, below the application start")]
    DataBelowSplitStart { address: u16 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Memory layout implied by the image's reset vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Application starts at MAIN memory start.
    Info,
    /// Application starts after the BSL's MAIN region.
    Split,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Info => write!(f, "INFO"),
            Layout::Split => write!(f, "Split"),
        }
    }
}

/// Dense MAIN memory image for one device profile.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    profile: DeviceProfile,
    data: Vec<u8>,
    /// XOR of every byte in `data`.
    checksum: u8,
}

impl MemoryImage {
    /// Erased image for `profile`.
    pub fn new(profile: DeviceProfile) -> Self {
        let data = vec![ERASED; profile.image_len()];
        let checksum = data.iter().fold(0, |acc, b| acc ^ b);
        Self {
            profile,
            data,
            checksum,
        }
    }

    /// Load a firmware file and lay it out for `profile`.
    pub fn parse(path: impl AsRef<Path>, profile: DeviceProfile) -> Result<Self, ImageError> {
        let file = FirmwareFile::load(path)?;
        Self::from_file(&file, profile)
    }

    pub fn from_file(file: &FirmwareFile, profile: DeviceProfile) -> Result<Self, ImageError> {
        let mut image = Self::new(profile);
        for segment in file.segments() {
            image.write(segment.address, &segment.data)?;
        }
        Ok(image)
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Running XOR over the whole buffer.
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Store `bytes` at `address`, keeping the checksum current.
    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), ImageError> {
        let origin = self.profile.main_start;
        if address < origin as u32 {
            return Err(ImageError::AddressBelowOrigin { address, origin });
        }

        let start = (address - origin as u32) as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(ImageError::AddressOutOfRange {
                address: origin as u32 + end as u32 - 1,
            });
        }

        for (cell, &byte) in self.data[start..end].iter_mut().zip(bytes) {
            self.checksum ^= *cell ^ byte;
            *cell = byte;
        }
        Ok(())
    }

    /// Little-endian reset vector at 0xFFFE.
    pub fn reset_vector(&self) -> u16 {
        let n = self.profile.firmware_len();
        u16::from_le_bytes([self.data[n - 1], self.data[n]])
    }

    /// Check the reset vector and the region it implies.
    pub fn validate(&self) -> Result<Layout, ImageError> {
        let main_start = self.profile.main_start;
        let split_start = self.profile.split_start();
        let vector = self.reset_vector();

        let layout = if vector == main_start {
            Layout::Info
        } else if vector == split_start {
            Layout::Split
        } else {
            return Err(ImageError::InvalidResetVector {
                found: vector,
                main_start,
                split_start,
            });
        };

        let entry = (vector - main_start) as usize;
        if self.data[entry..entry + 4].iter().all(|&b| b == ERASED) {
            return Err(ImageError::NoCodeAtResetVector { address: vector });
        }

        if layout == Layout::Split {
            let split = self.profile.split_size as usize;
            if let Some(pos) = self.data[..split].iter().position(|&b| b != ERASED) {
                return Err(ImageError::DataBelowSplitStart {
                    address: main_start + pos as u16,
                });
            }
        }

        Ok(layout)
    }

    /// Validate, embed the checksum and cut the bytes to transmit.
    ///
    /// The checksum excludes the reset vector and replaces its low byte.
    pub fn finalize(self) -> Result<FinalizedImage, ImageError> {
        let layout = self.validate()?;
        let n = self.profile.firmware_len();
        let mut data = self.data;

        let checksum = self.checksum ^ data[n - 1] ^ data[n];
        data[n - 1] = checksum;
        data.truncate(n);

        if layout == Layout::Split {
            data.drain(..self.profile.split_size as usize);
        }

        Ok(FinalizedImage {
            profile: self.profile,
            layout,
            checksum,
            data,
        })
    }
}

/// Image ready for transmission. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedImage {
    profile: DeviceProfile,
    layout: Layout,
    checksum: u8,
    data: Vec<u8>,
}

impl FinalizedImage {
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
