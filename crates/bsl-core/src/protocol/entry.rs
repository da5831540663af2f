//! Reset and BSL entry sequences driven through the modem lines.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constants::{RESET_PULSE_MS, RESET_SETTLE_MS};
use crate::transport::{BslTransport, TransportError};

/// Delays used while toggling RST and TEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryTiming {
    pub settle_ms: u64,
    pub pulse_ms: u64,
}

impl Default for EntryTiming {
    fn default() -> Self {
        Self {
            settle_ms: RESET_SETTLE_MS,
            pulse_ms: RESET_PULSE_MS,
        }
    }
}

impl EntryTiming {
    /// No delays; for simulated targets.
    pub const fn immediate() -> Self {
        Self {
            settle_ms: 0,
            pulse_ms: 0,
        }
    }
}

fn delay(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Reset the target, optionally starting the BSL instead of the application.
///
/// With `invoke_bsl`, TEST is pulsed twice while RST is low; the second
/// rising edge on TEST with RST released enters the bootloader.
pub fn reset_target<T: BslTransport + ?Sized>(
    transport: &mut T,
    invoke_bsl: bool,
    timing: &EntryTiming,
) -> Result<(), TransportError> {
    debug!(invoke_bsl, "Resetting target");
    transport.set_reset_line(true)?;
    transport.set_test_line(true)?;
    delay(timing.settle_ms);

    if invoke_bsl {
        transport.set_reset_line(false)?;
        transport.set_test_line(true)?;
        delay(timing.pulse_ms);
        transport.set_test_line(false)?;
        delay(timing.pulse_ms);
        transport.set_test_line(true)?;
        delay(timing.pulse_ms);
        transport.set_test_line(false)?;
        delay(timing.pulse_ms);
        transport.set_reset_line(true)?;
        delay(timing.pulse_ms);
        transport.set_test_line(true)?;
    } else {
        transport.set_reset_line(false)?;
        delay(timing.pulse_ms);
        transport.set_reset_line(true)?;
    }

    delay(timing.settle_ms);
    transport.purge()
}

/// Plain reset pulse on RST, used by the Value Line custom BSL.
pub fn pulse_reset<T: BslTransport + ?Sized>(
    transport: &mut T,
    timing: &EntryTiming,
) -> Result<(), TransportError> {
    transport.assert_reset()?;
    delay(timing.pulse_ms);
    transport.release_reset()?;
    delay(timing.settle_ms);
    Ok(())
}
