//! Byte-level serial handle abstraction.
//!
//! [`PortIo`] is the narrow surface the transport needs from an opened serial handle:
//! blocking `Read`/`Write` plus buffer inspection and clearing. [`SystemPort`] implements it
//! for real hardware with the `serialport` crate; [`MockPort`](super::mock::MockPort)
//! implements it for tests and simulation.
//!
//! DI-245 line settings are fixed: 115200 baud, 8 data bits, 1 stop bit, no parity,
//! hardware (RTS/CTS) flow control.

use std::io::{self, Read, Write};
use std::time::Duration;

/// Baud rate of the DI-245 virtual COM port.
pub const BAUD_RATE: u32 = 115_200;

/// Internal timeout of a single blocking read on a real port.
pub const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// An opened serial handle.
pub trait PortIo: Read + Write + Send + 'static {
    /// Whether the handle can still be used.
    fn is_open(&self) -> bool;

    /// Bytes received and not yet read.
    fn bytes_to_read(&self) -> io::Result<u32>;

    /// Bytes written and not yet transmitted.
    fn bytes_to_write(&self) -> io::Result<u32>;

    /// Discard everything in the receive buffer.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Discard everything in the transmit buffer.
    fn clear_output(&mut self) -> io::Result<()>;
}

impl PortIo for Box<dyn PortIo> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn bytes_to_read(&self) -> io::Result<u32> {
        (**self).bytes_to_read()
    }

    fn bytes_to_write(&self) -> io::Result<u32> {
        (**self).bytes_to_write()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }

    fn clear_output(&mut self) -> io::Result<()> {
        (**self).clear_output()
    }
}

/// I/O error kinds that mean the device is gone rather than momentarily quiet.
pub fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(feature = "instrument_serial")]
pub use system::SystemPort;

#[cfg(feature = "instrument_serial")]
mod system {
    use super::*;
    use crate::error::{AppResult, DaqError};
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::cell::Cell;
    use tracing::{debug, warn};

    /// A real serial port opened with the DI-245 line settings.
    ///
    /// The port is marked closed the first time an operation fails with a
    /// disconnect-class error (see [`is_disconnect`]), e.g. when the USB cable is pulled.
    pub struct SystemPort {
        inner: Box<dyn SerialPort>,
        name: String,
        open: Cell<bool>,
    }

    impl SystemPort {
        /// Open `path` (e.g. "/dev/ttyUSB0", "COM3").
        pub fn open(path: &str) -> AppResult<Self> {
            let inner = serialport::new(path, BAUD_RATE)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::Hardware)
                .timeout(PORT_READ_TIMEOUT)
                .open()
                .map_err(|e| DaqError::Io(e.into()))?;

            debug!("Serial port '{}' opened at {} baud", path, BAUD_RATE);
            Ok(Self {
                inner,
                name: path.to_string(),
                open: Cell::new(true),
            })
        }

        /// Port path the handle was opened with.
        pub fn name(&self) -> &str {
            &self.name
        }

        fn track<T>(&self, result: io::Result<T>) -> io::Result<T> {
            if let Err(err) = &result {
                if is_disconnect(err.kind()) && self.open.replace(false) {
                    warn!(port = %self.name, error = %err, "Serial port lost");
                }
            }
            result
        }
    }

    impl Read for SystemPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let result = self.inner.read(buf);
            self.track(result)
        }
    }

    impl Write for SystemPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let result = self.inner.write(buf);
            self.track(result)
        }

        fn flush(&mut self) -> io::Result<()> {
            let result = self.inner.flush();
            self.track(result)
        }
    }

    impl PortIo for SystemPort {
        fn is_open(&self) -> bool {
            self.open.get()
        }

        fn bytes_to_read(&self) -> io::Result<u32> {
            let result = self.inner.bytes_to_read().map_err(io::Error::from);
            self.track(result)
        }

        fn bytes_to_write(&self) -> io::Result<u32> {
            let result = self.inner.bytes_to_write().map_err(io::Error::from);
            self.track(result)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            let result = self.inner.clear(ClearBuffer::Input).map_err(io::Error::from);
            self.track(result)
        }

        fn clear_output(&mut self) -> io::Result<()> {
            let result = self.inner.clear(ClearBuffer::Output).map_err(io::Error::from);
            self.track(result)
        }
    }
}
