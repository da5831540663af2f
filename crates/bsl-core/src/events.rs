//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to subscribe to session events
//! without tight coupling to the protocol logic.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of a programming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BslPhase {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// Reset / entry sequence and first sync.
    Connecting,
    /// Sending the password.
    Unlocking,
    /// Reading the device ID block.
    Identifying,
    /// Mass or segment erase.
    Erasing,
    /// Loading the checksum-bug patch.
    Patching,
    /// Loading a replacement BSL into RAM.
    LoadingBsl,
    /// CHANGE_SPEED negotiation.
    ChangingBaud,
    /// Erase check before programming.
    EraseCheck,
    /// Writing firmware blocks.
    Programming,
    /// Reading back and comparing.
    Verifying,
    /// Restoring the Info-A segment.
    RestoringInfo,
    /// Dumping memory to a file.
    Reading,
    /// Whole-image transfer to a Value Line BSL.
    Transferring,
    /// Sign-off: offset reset, target reset, port restore.
    ShuttingDown,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for BslPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BslPhase::Idle => write!(f, "Idle"),
            BslPhase::Connecting => write!(f, "Connecting"),
            BslPhase::Unlocking => write!(f, "Unlocking"),
            BslPhase::Identifying => write!(f, "Identifying"),
            BslPhase::Erasing => write!(f, "Erasing"),
            BslPhase::Patching => write!(f, "Patching"),
            BslPhase::LoadingBsl => write!(f, "Loading BSL"),
            BslPhase::ChangingBaud => write!(f, "Changing Baud"),
            BslPhase::EraseCheck => write!(f, "Erase Check"),
            BslPhase::Programming => write!(f, "Programming"),
            BslPhase::Verifying => write!(f, "Verifying"),
            BslPhase::RestoringInfo => write!(f, "Restoring Info-A"),
            BslPhase::Reading => write!(f, "Reading"),
            BslPhase::Transferring => write!(f, "Transferring"),
            BslPhase::ShuttingDown => write!(f, "Shutting Down"),
            BslPhase::Complete => write!(f, "Complete"),
            BslPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by programming sessions.
#[derive(Debug, Clone)]
pub enum BslEvent {
    /// Phase changed.
    PhaseChanged { from: BslPhase, to: BslPhase },
    /// Progress update for current operation.
    Progress {
        phase: BslPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// ROM BSL identified the chip.
    DeviceIdentified {
        device_type: u16,
        bsl_version: u16,
    },
    /// Value Line BSL variant detected from the probe reply.
    VariantDetected {
        reply: u8,
        variant: String,
        main_start: u16,
    },
    /// Error occurred.
    Error { message: String },
    /// Serial traffic sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// All operations completed successfully.
    Complete,
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait BslObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BslEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BslObserver for NullObserver {
    fn on_event(&self, _event: &BslEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BslObserver for TracingObserver {
    fn on_event(&self, event: &BslEvent) {
        match event {
            BslEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            BslEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            BslEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            BslEvent::DeviceIdentified {
                device_type,
                bsl_version,
            } => {
                tracing::info!(
                    device = %format!("{:04X}", device_type),
                    bsl = %format!("{:X}.{:02X}", bsl_version >> 8, bsl_version & 0xFF),
                    "Device identified"
                );
            }
            BslEvent::VariantDetected {
                reply,
                variant,
                main_start,
            } => {
                tracing::info!(
                    reply = %format!("0x{:02X}", reply),
                    variant = %variant,
                    main = %format!("0x{:04X}", main_start),
                    "BSL variant detected"
                );
            }
            BslEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            BslEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "Serial packet");
            }
            BslEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

/// Observer that keeps every event, for tests and scripted front ends.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<BslEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BslEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Phases entered, in order.
    pub fn phases(&self) -> Vec<BslPhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BslEvent::PhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl BslObserver for RecordingObserver {
    fn on_event(&self, event: &BslEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event.clone());
    }
}
