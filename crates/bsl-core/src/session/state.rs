//! Runtime state of one incremental session.

use std::fmt;

use crate::events::BslPhase;
use crate::profile::DeviceId;
use crate::protocol::constants::LARGE_MODEL_ERROR_BUFFER;

/// Code model of a BSL loaded into RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamBslModel {
    Small,
    Large,
}

impl RamBslModel {
    pub fn from_word(word: u16) -> Self {
        if word == 0 {
            RamBslModel::Small
        } else {
            RamBslModel::Large
        }
    }
}

impl fmt::Display for RamBslModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RamBslModel::Small => write!(f, "SMALL"),
            RamBslModel::Large => write!(f, "LARGE"),
        }
    }
}

/// Which BSL currently answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadedBsl {
    #[default]
    Rom,
    Ram {
        model: RamBslModel,
        start: u16,
    },
}

/// Block progress tracking for one pass over the firmware.
#[derive(Debug, Default, Clone)]
pub struct BlockTracker {
    pub total_blocks: usize,
    pub current_block: usize,
    pub bytes_done: usize,
}

impl BlockTracker {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            total_blocks,
            ..Default::default()
        }
    }

    pub fn advance(&mut self, block_len: usize) {
        self.current_block += 1;
        self.bytes_done += block_len;
    }
}

/// State holding everything learned during a session.
#[derive(Debug, Default)]
pub struct SessionState {
    pub phase: BslPhase,
    /// Password file no longer matches after a mass erase.
    pub password_erased: bool,
    pub baud_rate: u32,
    /// Value last written with MEM_OFFSET.
    pub memory_offset: u16,
    pub device: Option<DeviceId>,
    /// RAM address holding the last error address.
    pub error_buffer: Option<u16>,
    pub patch_required: bool,
    pub patch_loaded: bool,
    pub loaded_bsl: LoadedBsl,
    /// Info-A backup taken before mass erase.
    pub info_a: Option<Vec<u8>>,
    pub bytes_programmed: usize,
}

impl SessionState {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Transition to a new phase.
    pub fn goto_phase(&mut self, phase: BslPhase) -> BslPhase {
        tracing::debug!(from = %self.phase, to = %phase, "Phase transition");
        std::mem::replace(&mut self.phase, phase)
    }

    /// Record the ID block and derive what depends on the BSL version.
    pub fn identify(&mut self, id: DeviceId) {
        self.device = Some(id);
        self.error_buffer = Some(id.error_buffer());
    }

    /// Address checks apply while an unpatched buggy ROM BSL is active.
    pub fn checksum_bug_active(&self) -> bool {
        match (self.loaded_bsl, self.device) {
            (LoadedBsl::Ram { .. }, _) => false,
            (LoadedBsl::Rom, Some(id)) => id.has_checksum_bug() && !self.patch_loaded,
            // Version unknown until the ID block is read.
            (LoadedBsl::Rom, None) => true,
        }
    }

    /// Whether the active BSL verifies blocks while programming.
    pub fn verifies_online(&self) -> bool {
        match self.loaded_bsl {
            LoadedBsl::Ram { .. } => true,
            LoadedBsl::Rom => self.device.is_some_and(|d| d.verifies_online()),
        }
    }

    /// Switch to a RAM BSL; the patch no longer applies.
    pub fn load_ram_bsl(&mut self, model: RamBslModel, start: u16) {
        self.loaded_bsl = LoadedBsl::Ram { model, start };
        self.patch_required = false;
        self.patch_loaded = false;
        if model == RamBslModel::Large {
            self.error_buffer = Some(LARGE_MODEL_ERROR_BUFFER);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(version: u16) -> DeviceId {
        DeviceId {
            device_type: 0xF149,
            process: 0,
            bsl_version: version,
        }
    }

    #[test]
    fn test_checksum_bug_tracking() {
        let mut state = SessionState::new(9600);
        assert!(state.checksum_bug_active());

        state.identify(id(0x0110));
        assert!(state.checksum_bug_active());
        state.patch_loaded = true;
        assert!(!state.checksum_bug_active());

        state.identify(id(0x0150));
        state.patch_loaded = false;
        assert!(!state.checksum_bug_active());
        assert_eq!(state.error_buffer, Some(0x0200));
    }

    #[test]
    fn test_ram_bsl_clears_patch() {
        let mut state = SessionState::new(9600);
        state.identify(id(0x0110));
        state.patch_required = true;
        state.load_ram_bsl(RamBslModel::Large, 0x0300);

        assert!(!state.patch_required);
        assert!(state.verifies_online());
        assert_eq!(state.error_buffer, Some(0x0200));
        assert!(!state.checksum_bug_active());
    }

    #[test]
    fn test_block_tracker() {
        let mut t = BlockTracker::new(2);
        t.advance(240);
        assert_eq!(t.current_block, 1);
        t.advance(10);
        assert_eq!((t.current_block, t.total_blocks), (2, 2));
        assert_eq!(t.bytes_done, 250);
    }
}
