//! Protocol module - MSP430 BSL wire definitions.

pub mod constants;
pub mod entry;
pub mod frame;
pub mod link;

pub use constants::*;
pub use entry::{EntryTiming, pulse_reset, reset_target};
pub use frame::{Frame, checksum};
pub use link::{BslLink, LinkTiming, ProtocolError, Reply};
