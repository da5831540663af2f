//! Host serial port transport.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use super::traits::{BslTransport, TransportError};

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::Serial(e.to_string())
    }
}

/// Port settings applied at open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// The ROM BSL uses 8E1; the Value Line custom BSL uses 8N1.
    pub even_parity: bool,
    /// Invert the DTR (RST) line.
    pub invert_dtr: bool,
    /// Invert the RTS (TEST) line.
    pub invert_rts: bool,
    pub timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            even_parity: true,
            invert_dtr: false,
            invert_rts: false,
            timeout_ms: 1000,
        }
    }
}

/// Line settings of a configured port, put back by `restore()`.
///
/// serialport applies the builder while opening, so the earliest state that
/// can be read back is the configured one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortSnapshot {
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    flow_control: FlowControl,
    timeout: Duration,
}

impl PortSnapshot {
    fn capture(port: &dyn SerialPort) -> Result<Self, TransportError> {
        Ok(Self {
            baud_rate: port.baud_rate()?,
            data_bits: port.data_bits()?,
            parity: port.parity()?,
            stop_bits: port.stop_bits()?,
            flow_control: port.flow_control()?,
            timeout: port.timeout(),
        })
    }

    fn apply(&self, port: &mut dyn SerialPort) -> Result<(), TransportError> {
        port.set_baud_rate(self.baud_rate)?;
        port.set_data_bits(self.data_bits)?;
        port.set_parity(self.parity)?;
        port.set_stop_bits(self.stop_bits)?;
        port.set_flow_control(self.flow_control)?;
        port.set_timeout(self.timeout)?;
        Ok(())
    }
}

/// `BslTransport` over a host serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
    settings: SerialSettings,
    original: PortSnapshot,
    baud: u32,
}

impl SerialTransport {
    /// Open `name` (e.g. `/dev/ttyUSB0`, `COM1`).
    pub fn open(name: &str, settings: SerialSettings) -> Result<Self, TransportError> {
        info!(port = name, baud = settings.baud_rate, "Opening serial port");
        let parity = if settings.even_parity {
            Parity::Even
        } else {
            Parity::None
        };

        let port = serialport::new(name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(parity)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(settings.timeout_ms))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                port: name.to_string(),
                message: e.to_string(),
            })?;

        Self::from_port(port, name, settings)
    }

    fn from_port(
        port: Box<dyn SerialPort>,
        name: &str,
        settings: SerialSettings,
    ) -> Result<Self, TransportError> {
        let original = PortSnapshot::capture(port.as_ref())?;
        debug!(port = name, ?original, "Port settings recorded");
        Ok(Self {
            port,
            name: name.to_string(),
            baud: original.baud_rate,
            settings,
            original,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl BslTransport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout)?;

        let result = match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(TransportError::Disconnected),
            Err(e) => Err(TransportError::Io(e)),
        };

        self.port.set_timeout(old_timeout)?;
        result
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        debug!(port = %self.name, baud, "Changing baud rate");
        self.port.set_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn set_reset_line(&mut self, level: bool) -> Result<(), TransportError> {
        self.port
            .write_data_terminal_ready(level != self.settings.invert_dtr)?;
        Ok(())
    }

    fn set_test_line(&mut self, level: bool) -> Result<(), TransportError> {
        self.port
            .write_request_to_send(level != self.settings.invert_rts)?;
        Ok(())
    }

    fn restore(&mut self) -> Result<(), TransportError> {
        debug!(port = %self.name, "Restoring port settings");
        self.original.apply(self.port.as_mut())?;
        self.baud = self.original.baud_rate;
        if let Err(e) = self.port.clear(ClearBuffer::All) {
            warn!(port = %self.name, "Failed to flush port on restore: {}", e);
        }
        Ok(())
    }
}

/// Names of the serial ports present on this host.
pub fn list_ports() -> Result<Vec<String>, TransportError> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serialport::TTYPort;

    #[test]
    fn test_restore_puts_back_recorded_settings() {
        let (mut master, _slave) = TTYPort::pair().unwrap();
        master.set_baud_rate(9600).unwrap();
        master.set_parity(Parity::Even).unwrap();

        let mut transport =
            SerialTransport::from_port(Box::new(master), "pty", SerialSettings::default())
                .unwrap();
        transport.set_baud_rate(38400).unwrap();
        transport.port.set_parity(Parity::None).unwrap();
        assert_eq!(transport.baud_rate(), 38400);

        transport.restore().unwrap();
        assert_eq!(transport.baud_rate(), 9600);
        assert_eq!(transport.port.baud_rate().unwrap(), 9600);
        assert_eq!(transport.port.parity().unwrap(), Parity::Even);
    }
}
