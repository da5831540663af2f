//! Program session - orchestrates an incremental ROM BSL run.
//!
//! The sequence follows the classic BSL download flow: entry sequence,
//! optional Info-A backup and mass erase, password, device identification,
//! checksum-bug patch or replacement RAM BSL, optional baud change, then the
//! per-block data actions, Info-A restore, memory dump and segment erase.
//! Sign-off always runs, also when a step fails.

pub mod config;
pub mod state;

pub use config::{Actions, MemoryRead, SessionConfig, TimingConfig};
pub use state::{BlockTracker, LoadedBsl, RamBslModel, SessionState};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::events::{BslEvent, BslObserver, BslPhase, LogLevel, PacketDirection, TracingObserver};
use crate::image::{FirmwareFile, ImageError, Layout, titxt};
use crate::profile::{BslVariant, DeviceId, ERASED};
use crate::protocol::constants::*;
use crate::protocol::{BslLink, Frame, ProtocolError, reset_target};
use crate::transport::{BslTransport, TransportError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Password not accepted by BSL")]
    PasswordRejected,

    #[error("Verification failed at 0x{address:04X}")]
    VerificationFailed { address: u32 },

    #[error("Erase check failed at 0x{address:04X}")]
    EraseCheckFailed { address: u32 },

    #[error("Device reported a checksum mismatch")]
    ChecksumMismatch,

    #[error("Image has {layout} layout but the installed BSL is {variant}")]
    VariantMismatch { layout: Layout, variant: BslVariant },

    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Summary of a completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub device: Option<DeviceId>,
    pub bytes_programmed: usize,
    pub baud_rate: u32,
    pub elapsed: Duration,
}

/// Per-block work selected for one pass over a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BlockOps {
    erase_check: bool,
    fast_check: bool,
    program: bool,
    verify: bool,
}

impl BlockOps {
    const ERASE_CHECK: Self = Self {
        erase_check: true,
        fast_check: false,
        program: false,
        verify: false,
    };
    const FAST_CHECK: Self = Self {
        erase_check: false,
        fast_check: true,
        program: false,
        verify: false,
    };
    const PROGRAM: Self = Self {
        erase_check: false,
        fast_check: false,
        program: true,
        verify: false,
    };
    const VERIFY: Self = Self {
        erase_check: false,
        fast_check: false,
        program: false,
        verify: true,
    };
    const PROGRAM_VERIFY: Self = Self {
        erase_check: false,
        fast_check: false,
        program: true,
        verify: true,
    };

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.erase_check {
            parts.push("EraseCheck");
        }
        if self.fast_check {
            parts.push("EraseCheckFast");
        }
        if self.program {
            parts.push("Program");
        }
        if self.verify {
            parts.push("Verify");
        }
        parts.join(" ")
    }
}

/// Program session for the TI ROM bootstrap loader.
pub struct ProgramSession<O: BslObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    frame_len: usize,
    // Loaded file data
    firmware: Option<FirmwareFile>,
    password: Option<FirmwareFile>,
    patch: Option<FirmwareFile>,
    new_bsl: Option<FirmwareFile>,
}

impl ProgramSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: BslObserver + 'static> ProgramSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        let frame_len = config.frame_data_len();
        Self {
            config,
            observer,
            frame_len,
            firmware: None,
            password: None,
            patch: None,
            new_bsl: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Parse every input file. Runs before any transport I/O.
    fn load_files(&mut self) -> Result<(), SessionError> {
        let load = |path: &Option<std::path::PathBuf>, what: &str| {
            path.as_ref()
                .map(|p| {
                    info!(path = %p.display(), "Loading {}", what);
                    FirmwareFile::load(p)
                })
                .transpose()
        };

        self.firmware = load(&self.config.firmware_path, "firmware")?;
        self.password = load(&self.config.password_path, "password file")?;
        self.patch = load(&self.config.patch_path, "patch")?;
        self.new_bsl = load(&self.config.new_bsl_path, "replacement BSL")?;

        if self.config.actions.uses_firmware() && self.firmware.is_none() {
            return Err(SessionError::InvalidConfig(
                "erase check, program and verify need a firmware file".to_string(),
            ));
        }
        Ok(())
    }

    /// Run the complete session on `transport`.
    ///
    /// The transport is restored before this returns, on success and on
    /// error. Closing it is left to the caller.
    #[instrument(skip(self, transport))]
    pub fn run<T: BslTransport>(&mut self, transport: &mut T) -> Result<SessionReport, SessionError> {
        let started = Instant::now();
        self.load_files()?;

        let mut state = SessionState::new(transport.baud_rate());
        let observable = ObservableTransport {
            inner: transport,
            observer: &self.observer,
        };
        let mut link = BslLink::new(observable, self.config.timing.link());
        link.set_checksum_bug_warning(state.checksum_bug_active());

        let result = self.run_passes(&mut link, &mut state);
        if let Err(e) = &result {
            self.observer.on_event(&BslEvent::Error {
                message: e.to_string(),
            });
        }
        let result = result.and(self.sign_off(&mut link, &mut state));

        match result {
            Ok(()) => {
                self.enter(&mut state, BslPhase::Complete);
                self.observer.on_event(&BslEvent::Complete);
                Ok(SessionReport {
                    device: state.device,
                    bytes_programmed: state.bytes_programmed,
                    baud_rate: state.baud_rate,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                self.enter(&mut state, BslPhase::Error);
                Err(e)
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&BslEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn enter(&self, state: &mut SessionState, phase: BslPhase) {
        let from = state.goto_phase(phase);
        if from != phase {
            self.observer
                .on_event(&BslEvent::PhaseChanged { from, to: phase });
        }
    }

    fn run_passes<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        let mut actions = self.config.actions;
        self.enter(state, BslPhase::Connecting);

        if !actions.user_called {
            reset_target(
                link.transport_mut(),
                actions.invoke_bsl,
                &self.config.timing.entry,
            )?;
        }

        loop {
            self.run_pass(link, state, &actions)?;
            if !actions.user_called {
                break;
            }
            self.log(
                LogLevel::Info,
                "No device reset - BSL called from user program, repeating",
            );
            actions.user_called = false;
        }
        Ok(())
    }

    fn run_pass<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        actions: &Actions,
    ) -> Result<(), SessionError> {
        // With a password the replacement BSL can be loaded first and do the
        // mass erase itself.
        let defer_erase = self.new_bsl.is_some() && self.active_password(state).is_some();

        if !defer_erase {
            if actions.restore_info_a && actions.mass_erase {
                self.backup_info_a(link, state)?;
            }
            if actions.mass_erase {
                self.mass_erase(link, state)?;
            }
        }

        if !actions.user_called {
            self.transmit_password(link, state)?;
        }

        self.identify(link, state)?;

        let buggy_rom = state.device.is_some_and(|d| d.has_checksum_bug());
        if buggy_rom && self.new_bsl.is_none() {
            self.log(LogLevel::Info, "Patch for flash programming required");
            state.patch_required = true;
        }
        link.set_checksum_bug_warning(state.checksum_bug_active());

        if state.patch_required || (self.new_bsl.is_some() && buggy_rom) {
            // Resets the BSL stack; protected commands lock again.
            info!("Load PC with 0x{:04X}", STACK_PREP_ADDR);
            link.execute(&Frame::command(BSL_LOAD_PC, STACK_PREP_ADDR, 0))?;
            self.transmit_password(link, state)?;
        }

        if let Some(bsl) = &self.new_bsl {
            self.load_new_bsl(link, state, bsl)?;
        }

        if state.patch_required {
            self.load_patch(link, state)?;
        }

        if defer_erase && actions.mass_erase {
            self.mass_erase(link, state)?;
        }

        if let Some(speed) = self.config.speed {
            self.change_speed(link, state, speed)?;
        }

        if actions.uses_firmware() {
            self.firmware_actions(link, state, actions)?;
        }

        if actions.restore_info_a {
            self.restore_info_a(link, state)?;
        }

        if let Some(read) = &self.config.read_back {
            self.enter(state, BslPhase::Reading);
            info!(
                start = %format!("0x{:04X}", read.start),
                len = read.length,
                file = %read.output.display(),
                "Read memory to file"
            );
            let data = self.read_memory(link, state, read.start, read.length as usize)?;
            titxt::write_file(&read.output, read.start, &data)?;
        }

        if let Some(address) = self.config.erase_segment {
            self.enter(state, BslPhase::Erasing);
            info!("Erase segment 0x{:04X}", address);
            let local = self.enter_region(link, state, address)?;
            link.execute(&Frame::command(
                BSL_ERASE_SEGMENT,
                local,
                SEGMENT_ERASE_KEY,
            ))?;
            self.leave_region(link, state)?;
        }

        Ok(())
    }

    /// Password source still valid on the device.
    fn active_password(&self, state: &SessionState) -> Option<&FirmwareFile> {
        if state.password_erased {
            None
        } else {
            self.password.as_ref()
        }
    }

    fn transmit_password<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        self.enter(state, BslPhase::Unlocking);

        let result = match self.active_password(state) {
            Some(file) => file
                .blocks(MAX_DATA_BYTES)
                .try_for_each(|(address, data)| {
                    link.execute(&Frame::password(address as u16, data))
                }),
            None => link.execute(&Frame::erased_password()),
        };

        result.map_err(|e| match e {
            ProtocolError::Nak { .. } => SessionError::PasswordRejected,
            e => e.into(),
        })
    }

    fn mass_erase<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        self.enter(state, BslPhase::Erasing);
        self.log(LogLevel::Info, "Mass erase");
        for cycle in 0..self.config.erase_cycles() {
            if cycle == 1 {
                info!("Additional mass erase cycles");
            }
            link.execute(&Frame::command(
                BSL_MASS_ERASE,
                MASS_ERASE_ADDR,
                MASS_ERASE_KEY,
            ))?;
        }
        // The vectors are 0xFF now; the erased password applies.
        state.password_erased = true;
        Ok(())
    }

    fn backup_info_a<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        info!("Read Info-A segment");
        self.transmit_password(link, state)?;
        let data = self.read_memory(link, state, INFO_A_ADDR as u32, INFO_A_LEN)?;
        state.info_a = Some(data);
        Ok(())
    }

    fn restore_info_a<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        let Some(backup) = state.info_a.take() else {
            return Ok(());
        };
        self.enter(state, BslPhase::RestoringInfo);

        // Leading erased bytes are not rewritten.
        let skip = backup.iter().take_while(|&&b| b == ERASED).count();
        if skip == backup.len() {
            self.log(LogLevel::Info, "Info-A backup is erased, nothing to restore");
            return Ok(());
        }

        self.log(LogLevel::Info, "Restore Info-A segment");
        let address = INFO_A_ADDR as u32 + skip as u32;
        self.process_block(link, state, address, &backup[skip..], BlockOps::PROGRAM)
    }

    fn identify<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        self.enter(state, BslPhase::Identifying);
        let block = self.read_memory(link, state, DEVICE_ID_ADDR as u32, DeviceId::LEN)?;
        let id = DeviceId::parse(&block).ok_or_else(|| {
            ProtocolError::CommunicationError("short device ID block".to_string())
        })?;

        info!("{}", id);
        state.identify(id);
        self.observer.on_event(&BslEvent::DeviceIdentified {
            device_type: id.device_type,
            bsl_version: id.bsl_version,
        });
        Ok(())
    }

    fn load_new_bsl<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        bsl: &FirmwareFile,
    ) -> Result<(), SessionError> {
        self.enter(state, BslPhase::LoadingBsl);
        let start = bsl
            .first_address()
            .filter(|&a| a != 0)
            .unwrap_or(DEFAULT_RAM_BSL_ADDR as u32);
        let online = state.verifies_online();
        info!(
            "Load{} new BSL into RAM at 0x{:04X}",
            if online { "/Verify" } else { "" },
            start
        );

        self.process_file(link, state, bsl, BlockOps::PROGRAM)?;
        if !online {
            info!("Verify new BSL");
            self.process_file(link, state, bsl, BlockOps::VERIFY)?;
        }

        let head = self.read_memory(link, state, start, 4)?;
        let vector = u16::from_le_bytes([head[0], head[1]]);
        let model = RamBslModel::from_word(u16::from_le_bytes([head[2], head[3]]));
        self.log(
            LogLevel::Info,
            format!("Start new BSL ({} model) at 0x{:04X}", model, vector),
        );
        link.execute(&Frame::command(BSL_LOAD_PC, vector, 0))?;

        state.load_ram_bsl(model, vector);
        link.set_checksum_bug_warning(state.checksum_bug_active());

        if model == RamBslModel::Large {
            self.transmit_password(link, state)?;
        }
        Ok(())
    }

    fn load_patch<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        let Some(patch) = &self.patch else {
            return Err(SessionError::InvalidConfig(
                "this BSL version needs the flash programming patch (--patch)".to_string(),
            ));
        };
        self.enter(state, BslPhase::Patching);
        info!("Load and verify patch");
        self.process_file(link, state, patch, BlockOps::PROGRAM_VERIFY)?;
        state.patch_loaded = true;
        link.set_checksum_bug_warning(state.checksum_bug_active());
        Ok(())
    }

    fn change_speed<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        speed: crate::profile::Speed,
    ) -> Result<(), SessionError> {
        self.enter(state, BslPhase::ChangingBaud);
        let id = state.device.ok_or_else(|| {
            SessionError::UnsupportedDevice("device not identified".to_string())
        })?;
        let family = id.family();
        let setting = family.clock_setting(speed).ok_or_else(|| {
            SessionError::UnsupportedDevice(format!("no baud rate table for family {}", family))
        })?;

        let current = link.transport().baud_rate();
        if setting.baud_rate == current {
            debug!(baud = current, "Baud rate already active");
            return Ok(());
        }

        let frame = Frame::command(
            BSL_CHANGE_SPEED,
            setting.register_word(),
            speed.index() as u16,
        );
        match link.execute(&frame) {
            Ok(()) => {
                link.transport_mut().set_baud_rate(setting.baud_rate)?;
                thread::sleep(Duration::from_millis(BAUD_SWITCH_DELAY_MS));
                state.baud_rate = setting.baud_rate;
                self.log(
                    LogLevel::Info,
                    format!("Baud rate changed from {} to {}", current, setting.baud_rate),
                );
            }
            Err(ProtocolError::Nak { .. }) => {
                self.log(
                    LogLevel::Warn,
                    format!("Change speed not accepted, baud rate remains at {}", current),
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn firmware_actions<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        actions: &Actions,
    ) -> Result<(), SessionError> {
        let Some(firmware) = &self.firmware else {
            return Err(SessionError::InvalidConfig("no firmware file".to_string()));
        };

        if actions.one_pass {
            let ops = BlockOps {
                erase_check: actions.erase_check,
                // The read-back check supersedes the fast check.
                fast_check: actions.fast_check && !actions.erase_check,
                program: actions.program,
                verify: actions.verify,
            };
            info!("{}", ops.describe());
            self.enter(state, BslPhase::Programming);
            return self.process_file(link, state, firmware, ops);
        }

        if actions.erase_check {
            self.enter(state, BslPhase::EraseCheck);
            info!("Erase check by file");
            self.process_file(link, state, firmware, BlockOps::ERASE_CHECK)?;
        }
        if actions.fast_check {
            self.enter(state, BslPhase::EraseCheck);
            info!("Fast erase check by file");
            self.process_file(link, state, firmware, BlockOps::FAST_CHECK)?;
        }
        if actions.program {
            self.enter(state, BslPhase::Programming);
            self.process_file(link, state, firmware, BlockOps::PROGRAM)?;
            info!("{} bytes programmed", state.bytes_programmed);
        }
        if actions.verify {
            if actions.program && state.verifies_online() {
                self.log(LogLevel::Info, "Verify already done during programming");
            } else {
                self.enter(state, BslPhase::Verifying);
                self.process_file(link, state, firmware, BlockOps::VERIFY)?;
            }
        }
        Ok(())
    }

    /// Apply `ops` to every block of `file`.
    fn process_file<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        file: &FirmwareFile,
        ops: BlockOps,
    ) -> Result<(), SessionError> {
        if ops.is_empty() {
            return Ok(());
        }

        let blocks = file.blocks(self.frame_len);
        let mut tracker = BlockTracker::new(blocks.total());
        for (address, data) in blocks {
            self.process_block(link, state, address, data, ops)?;
            tracker.advance(data.len());
            debug!(
                block = tracker.current_block,
                of = tracker.total_blocks,
                "{} done",
                ops.describe()
            );
            self.observer.on_event(&BslEvent::Progress {
                phase: state.phase,
                operation: ops.describe(),
                current: tracker.bytes_done as u64,
                total: file.total_len() as u64,
            });
        }
        Ok(())
    }

    fn process_block<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        address: u32,
        data: &[u8],
        ops: BlockOps,
    ) -> Result<(), SessionError> {
        debug!(address = %format!("0x{:04X}", address), len = data.len(), "{}", ops.describe());

        if ops.erase_check {
            let read = self.read_memory(link, state, address, data.len())?;
            if let Some(pos) = read.iter().position(|&b| b != ERASED) {
                return Err(SessionError::EraseCheckFailed {
                    address: address + pos as u32,
                });
            }
        }

        if ops.fast_check {
            self.prepare_patch(link, state)?;
            let local = self.enter_region(link, state, address)?;
            match link.execute(&Frame::command(BSL_ERASE_CHECK, local, data.len() as u16)) {
                Ok(()) => {}
                Err(ProtocolError::Nak { .. }) => {
                    return Err(SessionError::EraseCheckFailed { address });
                }
                Err(e) => return Err(e.into()),
            }
            self.leave_region(link, state)?;
        }

        if ops.program {
            self.prepare_patch(link, state)?;
            let local = self.enter_region(link, state, address)?;
            match link.execute(&Frame::block_write(local, data)) {
                Ok(()) => {}
                Err(ProtocolError::Nak { .. }) => {
                    return Err(self.program_failure(link, state, address));
                }
                Err(e) => return Err(e.into()),
            }
            self.leave_region(link, state)?;
            state.bytes_programmed += data.len();
        }

        if ops.verify {
            let read = self.read_memory(link, state, address, data.len())?;
            if let Some(pos) = read.iter().zip(data).position(|(a, b)| a != b) {
                return Err(SessionError::VerificationFailed {
                    address: address + pos as u32,
                });
            }
        }

        Ok(())
    }

    /// Locate a rejected block write. A RAM BSL records the failing address
    /// (plus 3) in its error buffer.
    fn program_failure<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        address: u32,
    ) -> SessionError {
        let (LoadedBsl::Ram { .. }, Some(buffer)) = (state.loaded_bsl, state.error_buffer) else {
            return SessionError::VerificationFailed { address };
        };

        let readback = if self.config.extended_memory {
            self.set_offset(link, state, 0)
                .and_then(|()| link.read_block(buffer, 2).map_err(SessionError::from))
        } else {
            link.read_block(buffer, 2).map_err(SessionError::from)
        };

        match readback {
            Ok(bytes) => {
                let reported = u16::from_le_bytes([bytes[0], bytes[1]]);
                SessionError::VerificationFailed {
                    address: reported.wrapping_sub(3) as u32,
                }
            }
            Err(e) => e,
        }
    }

    /// Read `len` bytes in frame-sized chunks.
    fn read_memory<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        address: u32,
        len: usize,
    ) -> Result<Vec<u8>, SessionError> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk_addr = address + out.len() as u32;
            let chunk_len = (len - out.len()).min(self.frame_len);

            self.prepare_patch(link, state)?;
            let local = self.enter_region(link, state, chunk_addr)?;
            let data = link.read_block(local, chunk_len)?;
            self.leave_region(link, state)?;
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Jump into the loaded patch so it handles the next command.
    fn prepare_patch<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &SessionState,
    ) -> Result<(), SessionError> {
        if state.patch_loaded {
            link.execute(&Frame::command(BSL_LOAD_PC, PATCH_ENTRY_ADDR, 0))?;
        }
        Ok(())
    }

    /// Select the 64K page of `address`; returns the in-page address.
    fn enter_region<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        address: u32,
    ) -> Result<u16, SessionError> {
        if self.config.extended_memory {
            self.set_offset(link, state, (address >> 16) as u16)?;
        } else if address > 0xFFFF {
            return Err(SessionError::InvalidConfig(format!(
                "address 0x{:X} needs extended memory addressing",
                address
            )));
        }
        Ok((address & 0xFFFF) as u16)
    }

    fn leave_region<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        if self.config.extended_memory && state.memory_offset != 0 {
            self.set_offset(link, state, 0)?;
        }
        Ok(())
    }

    fn set_offset<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
        high: u16,
    ) -> Result<(), SessionError> {
        link.execute(&Frame::command(BSL_MEM_OFFSET, 0, high))?;
        state.memory_offset = high;
        Ok(())
    }

    /// Offset reset, optional target reset and transport restore.
    fn sign_off<T: BslTransport>(
        &self,
        link: &mut BslLink<T>,
        state: &mut SessionState,
    ) -> Result<(), SessionError> {
        self.enter(state, BslPhase::ShuttingDown);

        let offset = if self.config.extended_memory {
            self.set_offset(link, state, 0)
        } else {
            Ok(())
        };
        if let Err(e) = &offset {
            self.log(LogLevel::Warn, format!("Failed to reset memory offset: {}", e));
        }

        let reset = if self.config.actions.reset {
            self.log(LogLevel::Info, "Reset target, starting application");
            reset_target(link.transport_mut(), false, &self.config.timing.entry)
                .map_err(SessionError::from)
        } else {
            Ok(())
        };

        let restore = link.transport_mut().restore().map_err(SessionError::from);
        offset.and(reset).and(restore)
    }
}

/// Transport wrapper that emits packet events.
pub(crate) struct ObservableTransport<'a, T: BslTransport, O: BslObserver> {
    pub(crate) inner: &'a mut T,
    pub(crate) observer: &'a Arc<O>,
}

impl<'a, T: BslTransport, O: BslObserver> BslTransport for ObservableTransport<'a, T, O> {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.observer.on_event(&BslEvent::Packet {
                direction: PacketDirection::Tx,
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let res = self.inner.read(buf, timeout);
        if let Ok(n) = &res
            && *n > 0
        {
            self.observer.on_event(&BslEvent::Packet {
                direction: PacketDirection::Rx,
                length: *n,
                data: Some(buf[..*n].iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        self.inner.purge()
    }

    fn baud_rate(&self) -> u32 {
        self.inner.baud_rate()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.inner.set_baud_rate(baud)
    }

    fn set_reset_line(&mut self, level: bool) -> Result<(), TransportError> {
        self.inner.set_reset_line(level)
    }

    fn set_test_line(&mut self, level: bool) -> Result<(), TransportError> {
        self.inner.set_test_line(level)
    }

    fn restore(&mut self) -> Result<(), TransportError> {
        self.inner.restore()
    }
}
