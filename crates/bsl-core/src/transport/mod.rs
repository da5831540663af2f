//! Transport layer module.

pub mod mock;
pub mod serial;
#[cfg(test)]
pub mod sim;
pub mod traits;

pub use mock::{LineEvent, MockTransport};
pub use serial::{SerialSettings, SerialTransport, list_ports};
pub use traits::{BslTransport, TransportError};
