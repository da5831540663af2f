//! Session configuration.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::profile::Speed;
use crate::protocol::constants::{
    DEFAULT_DATA_BYTES, MAX_DATA_BYTES, MIN_DATA_BYTES, REPLY_TIMEOUT_MS, SYNC_ATTEMPTS,
    SYNC_TIMEOUT_MS,
};
use crate::protocol::{EntryTiming, LinkTiming};

/// Which steps of the incremental sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Actions {
    pub mass_erase: bool,
    /// Read back every block and check for 0xFF.
    pub erase_check: bool,
    /// Let the BSL check every block (ERASE_CHECK command).
    pub fast_check: bool,
    pub program: bool,
    pub verify: bool,
    /// Reset the target (start the application) at sign-off.
    pub reset: bool,
    /// Back up Info-A before a mass erase and write it back afterwards.
    pub restore_info_a: bool,
    /// Run the TEST/RST entry sequence; otherwise only pulse reset.
    pub invoke_bsl: bool,
    /// The BSL was started by the application; skip entry and password on
    /// the first pass, then run again with them.
    pub user_called: bool,
    /// Wait for the user before the port is released.
    pub wait: bool,
    /// Erase-check, program and verify each block before moving on.
    pub one_pass: bool,
}

impl Default for Actions {
    fn default() -> Self {
        Self {
            mass_erase: true,
            erase_check: true,
            fast_check: false,
            program: true,
            verify: true,
            reset: true,
            restore_info_a: false,
            invoke_bsl: true,
            user_called: false,
            wait: false,
            one_pass: false,
        }
    }
}

impl Actions {
    /// Every data action off, BSL entry on.
    pub fn none() -> Self {
        Self {
            mass_erase: false,
            erase_check: false,
            fast_check: false,
            program: false,
            verify: false,
            reset: false,
            restore_info_a: false,
            invoke_bsl: true,
            user_called: false,
            wait: false,
            one_pass: false,
        }
    }

    /// Parse an action string such as `+ecpvr`.
    ///
    /// Only the listed actions are enabled. `a` implies `e`; `x` disables
    /// the BSL entry sequence. `one_pass` is left untouched.
    pub fn parse(spec: &str) -> Result<Self> {
        let Some(letters) = spec.strip_prefix('+') else {
            bail!("action list must start with '+': {}", spec);
        };

        let mut actions = Self::none();
        for c in letters.chars() {
            match c.to_ascii_lowercase() {
                'a' => {
                    actions.restore_info_a = true;
                    actions.mass_erase = true;
                }
                'e' => actions.mass_erase = true,
                'c' => actions.erase_check = true,
                'f' => actions.fast_check = true,
                'p' => actions.program = true,
                'v' => actions.verify = true,
                'r' => actions.reset = true,
                'u' => actions.user_called = true,
                'w' => actions.wait = true,
                'x' => actions.invoke_bsl = false,
                other => bail!("illegal action '{}'", other),
            }
        }
        Ok(actions)
    }

    /// Whether any step needs the firmware file.
    pub fn uses_firmware(&self) -> bool {
        self.erase_check || self.fast_check || self.program || self.verify
    }
}

/// Read-back request written to a TI-TXT file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRead {
    pub start: u32,
    pub length: u32,
    pub output: PathBuf,
}

/// Link and entry timing in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub sync_timeout_ms: u64,
    pub sync_attempts: u32,
    pub reply_timeout_ms: u64,
    pub entry: EntryTiming,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: SYNC_TIMEOUT_MS,
            sync_attempts: SYNC_ATTEMPTS,
            reply_timeout_ms: REPLY_TIMEOUT_MS,
            entry: EntryTiming::default(),
        }
    }
}

impl TimingConfig {
    pub fn link(&self) -> LinkTiming {
        LinkTiming {
            sync_timeout: std::time::Duration::from_millis(self.sync_timeout_ms),
            sync_attempts: self.sync_attempts.max(1),
            reply_timeout: std::time::Duration::from_millis(self.reply_timeout_ms),
        }
    }

    /// No entry delays and short link timeouts, for simulated targets.
    pub fn immediate() -> Self {
        Self {
            sync_timeout_ms: 1,
            sync_attempts: SYNC_ATTEMPTS,
            reply_timeout_ms: 1,
            entry: EntryTiming::immediate(),
        }
    }
}

/// Configuration for an incremental ROM BSL session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Firmware to check, program and verify.
    pub firmware_path: Option<PathBuf>,
    /// Interrupt vectors used as password; erased password if unset.
    pub password_path: Option<PathBuf>,
    /// Checksum-bug patch for BSL 1.10 and older.
    pub patch_path: Option<PathBuf>,
    /// Replacement BSL loaded into RAM.
    pub new_bsl_path: Option<PathBuf>,
    /// Payload bytes per frame.
    pub max_data: usize,
    pub mass_erase_cycles: u32,
    pub speed: Option<Speed>,
    /// Send MEM_OFFSET around block operations (MSP430X).
    pub extended_memory: bool,
    pub erase_segment: Option<u32>,
    // Tables last so the TOML form stays valid.
    pub actions: Actions,
    pub read_back: Option<MemoryRead>,
    pub timing: TimingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            firmware_path: None,
            password_path: None,
            patch_path: None,
            new_bsl_path: None,
            max_data: DEFAULT_DATA_BYTES,
            mass_erase_cycles: 1,
            speed: None,
            extended_memory: false,
            erase_segment: None,
            actions: Actions::default(),
            read_back: None,
            timing: TimingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Switch to a memory dump: no erase, check, program or verify.
    pub fn dump_memory(&mut self, start: u32, length: u32, output: PathBuf) {
        self.actions.mass_erase = false;
        self.actions.erase_check = false;
        self.actions.fast_check = false;
        self.actions.program = false;
        self.actions.verify = false;
        self.read_back = Some(MemoryRead {
            start,
            length,
            output,
        });
    }

    /// Switch to a single segment erase; nothing else runs.
    pub fn erase_segment_only(&mut self, address: u32) {
        self.actions = Actions {
            wait: self.actions.wait,
            ..Actions::none()
        };
        self.read_back = None;
        self.erase_segment = Some(address);
    }

    /// Frame payload clamped to 16..=250 and rounded down to a multiple of 16.
    pub fn frame_data_len(&self) -> usize {
        let clamped = self.max_data.clamp(MIN_DATA_BYTES, MAX_DATA_BYTES);
        let len = clamped - clamped % MIN_DATA_BYTES;
        if len != self.max_data {
            info!(
                requested = self.max_data,
                used = len,
                "Max. number of data bytes within one frame adjusted"
            );
        }
        len
    }

    pub fn erase_cycles(&self) -> u32 {
        self.mass_erase_cycles.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_actions() {
        let a = Actions::default();
        assert!(a.mass_erase && a.erase_check && a.program && a.verify && a.reset);
        assert!(!a.fast_check && !a.user_called && !a.restore_info_a);
    }

    #[test]
    fn test_parse_actions() {
        let a = Actions::parse("+cpv").unwrap();
        assert!(a.erase_check && a.program && a.verify);
        assert!(!a.mass_erase && !a.reset);

        let a = Actions::parse("+aX").unwrap();
        assert!(a.restore_info_a && a.mass_erase);
        assert!(!a.invoke_bsl);

        assert!(Actions::parse("cpv").is_err());
        assert!(Actions::parse("+q").is_err());
    }

    #[test]
    fn test_frame_data_len() {
        let mut c = SessionConfig::default();
        assert_eq!(c.frame_data_len(), 240);
        c.max_data = 1000;
        assert_eq!(c.frame_data_len(), 240);
        c.max_data = 3;
        assert_eq!(c.frame_data_len(), 16);
        c.max_data = 100;
        assert_eq!(c.frame_data_len(), 96);
    }

    #[test]
    fn test_dump_and_segment_modes() {
        let mut c = SessionConfig::default();
        c.dump_memory(0x1000, 0x100, "dump.txt".into());
        assert!(!c.actions.uses_firmware());
        assert!(!c.actions.mass_erase);
        assert!(c.actions.reset);

        c.erase_segment_only(0x1080);
        assert!(!c.actions.reset);
        assert!(c.read_back.is_none());
        assert_eq!(c.erase_segment, Some(0x1080));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SessionConfig::default();
        config.firmware_path = Some("app.txt".into());
        config.speed = Some(Speed::Baud38400);
        config.actions.one_pass = true;

        let text = toml::to_string_pretty(&config).unwrap();
        let back: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.firmware_path, config.firmware_path);
        assert_eq!(back.speed, Some(Speed::Baud38400));
        assert!(back.actions.one_pass);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str("max_data = 128\nspeed = 1\n").unwrap();
        assert_eq!(config.max_data, 128);
        assert_eq!(config.speed, Some(Speed::Baud19200));
        assert_eq!(config.mass_erase_cycles, 1);
        assert!(config.actions.program);

        assert!(toml::from_str::<SessionConfig>("speed = 7\n").is_err());
    }
}
