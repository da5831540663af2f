//! BSL-Core: MSP430 bootstrap loader protocols in Rust.
//!
//! Two ways of getting firmware onto an MSP430 over a serial port:
//!
//! - **Incremental** ([`session::ProgramSession`]): the TI ROM BSL found in
//!   F1xx/F2xx/F4xx parts. Framed, checksummed commands for password,
//!   erase, block write/read, erase check, baud change and memory offset,
//!   plus the checksum-bug patch and RAM-loaded replacement BSLs.
//! - **Whole-image** ([`flasher::WholeImageFlasher`]): the custom Value Line
//!   BSL for G2231 / G2xx1 / G2xx2 parts, which takes the complete MAIN
//!   image in one transfer and checks an embedded XOR checksum.
//!
//! # Architecture
//!
//! - **Image**: TI-TXT / Intel-Hex parsing, dense MAIN images, TI-TXT output
//! - **Profile**: device geometry, probe reply tables, clock tables
//! - **Protocol**: constants, frame codec, sync and reply handling, entry
//!   sequences
//! - **Transport**: serial port abstraction (serialport, mock)
//! - **Events**: observer pattern for UI decoupling
//! - **Session / Flasher**: high-level orchestrators
//!
//! # Example
//!
//! ```no_run
//! use bsl_core::session::{ProgramSession, SessionConfig};
//! use bsl_core::transport::{SerialSettings, SerialTransport};
//!
//! let config = SessionConfig {
//!     firmware_path: Some("app.txt".into()),
//!     ..Default::default()
//! };
//!
//! let mut port = SerialTransport::open("/dev/ttyUSB0", SerialSettings::default())
//!     .expect("open port");
//! let report = ProgramSession::new(config)
//!     .run(&mut port)
//!     .expect("programming failed");
//! println!("{} bytes programmed", report.bytes_programmed);
//! ```

pub mod events;
pub mod flasher;
pub mod image;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use events::{BslEvent, BslObserver, BslPhase, LogLevel, NullObserver, TracingObserver};
pub use flasher::{FlashOutcome, FlasherConfig, WholeImageFlasher};
pub use image::{FinalizedImage, FirmwareFile, ImageError, Layout, MemoryImage};
pub use profile::{BslVariant, DeviceFamily, DeviceId, DeviceProfile, Speed, TargetModel};
pub use protocol::{Frame, ProtocolError};
pub use session::{Actions, ProgramSession, SessionConfig, SessionError, SessionReport};
pub use transport::{BslTransport, MockTransport, SerialSettings, SerialTransport, TransportError};
