use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer};

/// Baud rate of the serial CAN bridge
pub const BRIDGE_BAUD: usize = 115200;

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new programmer attached to a serial CAN bridge
    pub fn linux<P: AsRef<Path>>(port: P, options: Options) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(BRIDGE_BAUD))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0
            .set_timeout(Duration::from_millis(options.read_timeout_ms as u64))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
