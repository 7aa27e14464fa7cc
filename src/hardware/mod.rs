//! Serial hardware access.
//!
//! - [`port`]: the [`PortIo`] handle trait and the real `serialport`-backed port.
//! - [`transport`]: write/read/query primitives with flush-before-write and bounded reads.
//! - [`mock`]: an in-process DI-245 emulator.

pub mod mock;
pub mod port;
pub mod transport;

pub use mock::MockPort;
pub use port::PortIo;
#[cfg(feature = "instrument_serial")]
pub use port::SystemPort;
pub use transport::{Reply, SerialTransport};

/// Open a real serial port by path, boxed for use with the acquisition controller.
#[cfg(feature = "instrument_serial")]
pub fn open_port(path: &str) -> crate::error::AppResult<Box<dyn PortIo>> {
    Ok(Box::new(SystemPort::open(path)?))
}

/// Open a real serial port by path, boxed for use with the acquisition controller.
#[cfg(not(feature = "instrument_serial"))]
pub fn open_port(_path: &str) -> crate::error::AppResult<Box<dyn PortIo>> {
    Err(crate::error::DaqError::SerialFeatureDisabled)
}
