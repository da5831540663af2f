//! Serial transport abstraction.
//!
//! Defines the `BslTransport` trait for the byte link to the target,
//! allowing different implementations (serialport, mock, etc.).
//!
//! Besides the data path the BSL needs two modem lines: DTR drives the
//! target's RST/NMI pin and RTS drives its TEST (or TCK) pin.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract byte transport to an MSP430 bootstrap loader.
///
/// This trait enables:
/// - Production implementation on a host serial port
/// - Mock implementation for unit testing
/// - Wrappers such as the event-emitting `ObservableTransport`
pub trait BslTransport: Send {
    /// Write raw bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Discard any pending received bytes.
    fn purge(&mut self) -> Result<(), TransportError>;

    /// Current host baud rate.
    fn baud_rate(&self) -> u32;

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;

    /// Drive the RST/NMI pin. `false` holds the target in reset.
    fn set_reset_line(&mut self, level: bool) -> Result<(), TransportError>;

    /// Drive the TEST pin.
    fn set_test_line(&mut self, level: bool) -> Result<(), TransportError>;

    /// Restore the settings captured when the transport was opened.
    fn restore(&mut self) -> Result<(), TransportError>;

    /// Write everything or fail.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut sent = 0;
        while sent < data.len() {
            let n = self.write(&data[sent..])?;
            if n == 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", sent, data.len()),
                )));
            }
            sent += n;
        }
        Ok(())
    }

    fn assert_reset(&mut self) -> Result<(), TransportError> {
        self.set_reset_line(false)
    }

    fn release_reset(&mut self) -> Result<(), TransportError> {
        self.set_reset_line(true)
    }
}

impl<T: BslTransport + ?Sized> BslTransport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        (**self).purge()
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        (**self).set_baud_rate(baud)
    }

    fn set_reset_line(&mut self, level: bool) -> Result<(), TransportError> {
        (**self).set_reset_line(level)
    }

    fn set_test_line(&mut self, level: bool) -> Result<(), TransportError> {
        (**self).set_test_line(level)
    }

    fn restore(&mut self) -> Result<(), TransportError> {
        (**self).restore()
    }
}
