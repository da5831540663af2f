//! Whole-image flasher for the custom Value Line BSL.
//!
//! The device answers a probe byte with its BSL variant, receives the
//! complete MAIN image (checksum embedded in place of the reset vector's low
//! byte) after a command byte, and replies with a single ACK or NACK. The
//! host never reads memory back.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::events::{BslEvent, BslObserver, BslPhase, LogLevel, TracingObserver};
use crate::image::{FinalizedImage, FirmwareFile, Layout, MemoryImage};
use crate::profile::{DetectedBsl, TargetModel};
use crate::protocol::constants::*;
use crate::protocol::link::read_byte;
use crate::protocol::{EntryTiming, ProtocolError, pulse_reset};
use crate::session::{ObservableTransport, SessionError};
use crate::transport::BslTransport;

/// Configuration of a whole-image run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    pub model: TargetModel,
    /// Image to flash; only the variant is reported when unset.
    pub firmware_path: Option<PathBuf>,
    pub probe_attempts: u32,
    pub probe_timeout_ms: u64,
    /// Pause between command byte and image, while the BSL erases.
    pub command_delay_ms: u64,
    pub reply_timeout_ms: u64,
    pub entry: EntryTiming,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            model: TargetModel::default(),
            firmware_path: None,
            probe_attempts: VL_PROBE_ATTEMPTS,
            probe_timeout_ms: VL_SYNC_TIMEOUT_MS,
            command_delay_ms: VL_COMMAND_DELAY_MS,
            reply_timeout_ms: VL_REPLY_TIMEOUT_MS,
            entry: EntryTiming::default(),
        }
    }
}

impl FlasherConfig {
    /// No delays, for scripted transports.
    pub fn immediate() -> Self {
        Self {
            probe_timeout_ms: 1,
            command_delay_ms: 0,
            reply_timeout_ms: 1,
            entry: EntryTiming::immediate(),
            ..Default::default()
        }
    }
}

/// What a whole-image run found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOutcome {
    pub detected: DetectedBsl,
    pub probe_reply: u8,
    /// Image bytes sent, 0 when only detecting.
    pub bytes_sent: usize,
    pub checksum: Option<u8>,
}

/// Flasher for G2231 / G2xx1 / G2xx2 parts with the custom BSL.
pub struct WholeImageFlasher<O: BslObserver> {
    config: FlasherConfig,
    observer: Arc<O>,
}

impl WholeImageFlasher<TracingObserver> {
    pub fn new(config: FlasherConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: BslObserver + 'static> WholeImageFlasher<O> {
    pub fn with_observer(config: FlasherConfig, observer: Arc<O>) -> Self {
        Self { config, observer }
    }

    pub fn config(&self) -> &FlasherConfig {
        &self.config
    }

    /// Detect the BSL and, with a firmware file configured, flash it.
    ///
    /// File errors, and image errors for models with a fixed profile, are
    /// reported before the port is touched. The transport is restored on
    /// every path that reached it.
    #[instrument(skip(self, transport), fields(model = %self.config.model))]
    pub fn run<T: BslTransport>(&self, transport: &mut T) -> Result<FlashOutcome, SessionError> {
        let file = self
            .config
            .firmware_path
            .as_ref()
            .map(|path| {
                info!(path = %path.display(), "Loading firmware");
                FirmwareFile::load(path)
            })
            .transpose()?;
        let prepared = match (&file, self.config.model.fixed_profile()) {
            (Some(file), Some(profile)) => Some(MemoryImage::from_file(file, profile)?.finalize()?),
            _ => None,
        };

        let mut phase = BslPhase::Idle;
        let mut observable = ObservableTransport {
            inner: transport,
            observer: &self.observer,
        };
        let result = self.transfer(&mut observable, &mut phase, file.as_ref(), prepared);

        self.enter(&mut phase, BslPhase::ShuttingDown);
        let restored = observable.restore();
        let result = match (result, restored) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), restored) => {
                if let Err(restore) = restored {
                    self.log(
                        LogLevel::Warn,
                        format!("Failed to restore port settings: {}", restore),
                    );
                }
                Err(e)
            }
        };

        match result {
            Ok(outcome) => {
                self.enter(&mut phase, BslPhase::Complete);
                self.observer.on_event(&BslEvent::Complete);
                Ok(outcome)
            }
            Err(e) => {
                self.observer.on_event(&BslEvent::Error {
                    message: e.to_string(),
                });
                self.enter(&mut phase, BslPhase::Error);
                Err(e)
            }
        }
    }

    /// Reset the target and probe until the reply names a known variant.
    pub fn detect<T: BslTransport>(&self, transport: &mut T) -> Result<(DetectedBsl, u8), SessionError> {
        info!("Resetting MCU via DTR");
        pulse_reset(transport, &self.config.entry)?;
        transport.purge()?;

        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let attempts = self.config.probe_attempts.max(1);
        for attempt in 1..=attempts {
            info!(attempt, "Sending sync");
            transport.write_all(&[VL_PROBE])?;

            let Some(reply) = read_byte(transport, timeout)? else {
                info!("No response");
                continue;
            };
            let Some(detected) = self.config.model.lookup(reply) else {
                self.log(LogLevel::Warn, format!("Invalid response 0x{:02X}", reply));
                continue;
            };

            info!(
                "Sync acknowledged - {} BSL, MAIN = 0x{:04X}, AppStart = 0x{:04X}",
                detected.variant,
                detected.profile.main_start,
                detected.app_start()
            );
            self.observer.on_event(&BslEvent::VariantDetected {
                reply,
                variant: detected.variant.to_string(),
                main_start: detected.profile.main_start,
            });
            return Ok((detected, reply));
        }

        Err(ProtocolError::SyncFailed { attempts }.into())
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&BslEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn enter(&self, phase: &mut BslPhase, to: BslPhase) {
        let from = std::mem::replace(phase, to);
        if from != to {
            self.observer.on_event(&BslEvent::PhaseChanged { from, to });
        }
    }

    fn transfer<T: BslTransport>(
        &self,
        transport: &mut T,
        phase: &mut BslPhase,
        file: Option<&FirmwareFile>,
        prepared: Option<FinalizedImage>,
    ) -> Result<FlashOutcome, SessionError> {
        self.enter(phase, BslPhase::Connecting);
        let (detected, probe_reply) = self.detect(transport)?;

        let Some(file) = file else {
            return Ok(FlashOutcome {
                detected,
                probe_reply,
                bytes_sent: 0,
                checksum: None,
            });
        };

        let image = match prepared {
            Some(image) => image,
            None => MemoryImage::from_file(file, detected.profile)?.finalize()?,
        };
        let expected = if detected.variant.is_split() {
            Layout::Split
        } else {
            Layout::Info
        };
        if image.layout() != expected {
            return Err(SessionError::VariantMismatch {
                layout: image.layout(),
                variant: detected.variant,
            });
        }

        self.enter(phase, BslPhase::Transferring);
        info!("Sending command byte");
        transport.write_all(&[VL_COMMAND])?;
        if self.config.command_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.command_delay_ms));
        }

        info!(
            bytes = image.len(),
            checksum = %format!("0x{:02X}", image.checksum()),
            "Sending firmware data and checksum"
        );
        transport.write_all(image.as_bytes())?;
        self.observer.on_event(&BslEvent::Progress {
            phase: *phase,
            operation: "Image".to_string(),
            current: image.len() as u64,
            total: image.len() as u64,
        });

        let timeout = Duration::from_millis(self.config.reply_timeout_ms);
        match read_byte(transport, timeout)? {
            Some(VL_ACK) => {
                self.log(LogLevel::Info, "Update successful");
                Ok(FlashOutcome {
                    detected,
                    probe_reply,
                    bytes_sent: image.len(),
                    checksum: Some(image.checksum()),
                })
            }
            Some(VL_NACK) => Err(SessionError::ChecksumMismatch),
            Some(other) => Err(ProtocolError::CommunicationError(format!(
                "invalid response 0x{:02X}",
                other
            ))
            .into()),
            None => Err(ProtocolError::Timeout {
                timeout_ms: self.config.reply_timeout_ms,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::image::ImageError;
    use crate::profile::BslVariant;
    use crate::transport::sim::scratch_file;
    use crate::transport::{LineEvent, MockTransport};

    const INFO_APP: &str = "@F800\n31 40 00 03\n@FFFE\n00 F8\nq\n";

    fn flasher(model: TargetModel, firmware: Option<PathBuf>) -> WholeImageFlasher<NullObserver> {
        let config = FlasherConfig {
            model,
            firmware_path: firmware,
            ..FlasherConfig::immediate()
        };
        WholeImageFlasher::with_observer(config, Arc::new(NullObserver))
    }

    #[test]
    fn test_detect_only() {
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0xC0]);

        let outcome = flasher(TargetModel::G2xx12, None).run(&mut mock).unwrap();
        assert_eq!(outcome.detected.variant, BslVariant::Split);
        assert_eq!(outcome.detected.profile.main_start, 0xF000);
        assert_eq!(outcome.detected.app_start(), 0xF060);
        assert_eq!(outcome.bytes_sent, 0);

        assert_eq!(mock.get_writes(), vec![vec![VL_PROBE]]);
        use LineEvent::*;
        assert_eq!(
            mock.line_events(),
            vec![Reset(false), Reset(true), Purge, Restore]
        );
    }

    #[test]
    fn test_detect_retries_invalid_reply() {
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0x12, 0xF8]);

        let observer = Arc::new(RecordingObserver::new());
        let config = FlasherConfig {
            model: TargetModel::G2xx12,
            ..FlasherConfig::immediate()
        };
        let outcome = WholeImageFlasher::with_observer(config, observer.clone())
            .run(&mut mock)
            .unwrap();
        assert_eq!(outcome.probe_reply, 0xF8);
        assert_eq!(outcome.detected.variant, BslVariant::Info);
        assert_eq!(mock.get_writes().len(), 2);
        assert!(observer.events().iter().any(|e| matches!(
            e,
            BslEvent::Log {
                level: LogLevel::Warn,
                message
            } if message == "Invalid response 0x12"
        )));
    }

    #[test]
    fn test_detect_gives_up() {
        let mut mock = MockTransport::new();
        let err = flasher(TargetModel::G2xx12, None).run(&mut mock).unwrap_err();

        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::SyncFailed { attempts: 3 })
        ));
        assert_eq!(mock.get_writes().len(), 3);
        assert!(mock.was_restored());
    }

    #[test]
    fn test_flash_info_image() {
        let path = scratch_file("vl-info.txt", INFO_APP);
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0xF8, VL_ACK]);

        let observer = Arc::new(RecordingObserver::new());
        let config = FlasherConfig {
            firmware_path: Some(path),
            ..FlasherConfig::immediate()
        };
        let outcome = WholeImageFlasher::with_observer(config, observer.clone())
            .run(&mut mock)
            .unwrap();
        assert_eq!(outcome.bytes_sent, 2047);

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[1], vec![VL_COMMAND]);
        let image = &writes[2];
        assert_eq!(image.len(), 2047);
        assert_eq!(&image[..4], &[0x31, 0x40, 0x00, 0x03]);
        // 0x31 ^ 0x40 ^ 0x00 ^ 0x03 ^ (2042 x 0xFF)
        assert_eq!(image[2046], 0x72);
        assert_eq!(outcome.checksum, Some(0x72));
        assert!(mock.was_restored());

        assert_eq!(
            observer.phases(),
            vec![
                BslPhase::Connecting,
                BslPhase::Transferring,
                BslPhase::ShuttingDown,
                BslPhase::Complete
            ]
        );
    }

    #[test]
    fn test_flash_legacy_split_image() {
        let path = scratch_file("vl-split.txt", "@F850\n31 40 00 03\n@FFFE\n50 F8\nq\n");
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0xFE, VL_ACK]);

        let outcome = flasher(TargetModel::G2231, Some(path)).run(&mut mock).unwrap();
        assert_eq!(outcome.detected.variant, BslVariant::LegacySplit);
        let writes = mock.get_writes();
        assert_eq!(writes[2].len(), 2047 - 0x50);
        assert_eq!(&writes[2][..2], &[0x31, 0x40]);
    }

    #[test]
    fn test_checksum_nack() {
        let path = scratch_file("vl-nack.txt", INFO_APP);
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0xF8, VL_NACK]);

        let err = flasher(TargetModel::G2xx12, Some(path)).run(&mut mock).unwrap_err();
        assert!(matches!(err, SessionError::ChecksumMismatch));
        assert!(mock.was_restored());
    }

    #[test]
    fn test_no_final_reply() {
        let path = scratch_file("vl-silent.txt", INFO_APP);
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0xF8]);

        let err = flasher(TargetModel::G2xx12, Some(path)).run(&mut mock).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::Timeout { .. })
        ));
    }

    #[test]
    fn test_variant_mismatch_sends_nothing() {
        let path = scratch_file("vl-mismatch.txt", INFO_APP);
        let mut mock = MockTransport::new();
        // MAIN at 0xF000: a vector of 0xF800 fits neither layout.
        mock.queue_reply(&[0xC0]);

        let err = flasher(TargetModel::G2xx12, Some(path)).run(&mut mock).unwrap_err();
        assert!(matches!(err, SessionError::Image(ImageError::InvalidResetVector { .. })));
        assert_eq!(mock.get_writes(), vec![vec![VL_PROBE]]);
    }

    #[test]
    fn test_layout_must_match_variant() {
        // INFO layout image for a part whose G2231 BSL is split.
        let path = scratch_file("vl-layout.txt", INFO_APP);
        let mut mock = MockTransport::new();
        mock.queue_reply(&[0xFE]);

        let err = flasher(TargetModel::G2231, Some(path)).run(&mut mock).unwrap_err();
        assert!(matches!(
            err,
            SessionError::VariantMismatch {
                layout: Layout::Info,
                variant: BslVariant::LegacySplit
            }
        ));
        assert_eq!(mock.get_writes().len(), 1);
    }

    #[test]
    fn test_fixed_profile_image_errors_before_io() {
        let path = scratch_file("vl-bad.txt", "@F800\n31 40\n@FFFE\n00 00\nq\n");
        let mut mock = MockTransport::new();

        let err = flasher(TargetModel::G2231, Some(path)).run(&mut mock).unwrap_err();
        assert!(matches!(err, SessionError::Image(ImageError::InvalidResetVector { .. })));
        assert!(mock.get_writes().is_empty());
        assert!(mock.line_events().is_empty());
    }
}
