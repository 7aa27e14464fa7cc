//! Custom error types for the driver.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of the
//! crate. Using the `thiserror` crate, it gives a single place where protocol, transport,
//! session-state and configuration failures are described.
//!
//! ## Error Hierarchy
//!
//! - **Transport**: `PortClosed`, `TransportUnavailable`, `CommandNotSent`. Ordinary I/O
//!   faults never show up here; the transport turns them into `false` or
//!   [`Reply::TimedOut`](crate::hardware::transport::Reply) values.
//! - **Protocol**: `CommandEchoMismatch`, `UnknownSensorCode`, `InvalidChannel`, `Decode`,
//!   `SyncTimeout`, `SyncLost`.
//! - **Session**: `InvalidState`, `StopTimedOut`, `TaskJoin`.
//! - **Configuration**: `Figment` (file/env parsing), `Configuration` and `InvalidScanList`
//!   (semantic checks), `FrameWidthMismatch`.
//!
//! A read timeout is deliberately not an error variant: the acquisition loop treats it as a
//! normal "nothing yet" outcome.

use std::time::Duration;
use thiserror::Error;

use crate::acquisition::SessionState;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the DI-245 driver.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The serial handle reports that it is closed (or was lost).
    #[error("Serial port is closed")]
    PortClosed,

    /// The transport is currently owned by the acquisition task or was lost with it.
    #[error("Serial transport is not available")]
    TransportUnavailable,

    /// A command frame could not be written to the port.
    #[error("Command {0:?} could not be sent")]
    CommandNotSent(String),

    /// The device echoed something other than the frame that was sent.
    #[error("Echo mismatch for {command}: sent {sent:?}, device echoed {echoed:?}")]
    CommandEchoMismatch {
        /// Printable form of the command.
        command: String,
        /// Bytes expected back from the device.
        sent: Vec<u8>,
        /// Bytes actually received (empty on timeout).
        echoed: Vec<u8>,
    },

    /// A gain or thermocouple tag that is not in the device code table.
    #[error("Unknown gain/sensor code: {0}")]
    UnknownSensorCode(String),

    /// Physical channel outside the 4-bit field.
    #[error("Physical channel {0} is out of range (0-15)")]
    InvalidChannel(u8),

    /// Scan positions are not a contiguous `0..N-1` set.
    #[error("Invalid scan list: {0}")]
    InvalidScanList(String),

    /// Operation attempted in the wrong session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Name of the rejected operation.
        operation: &'static str,
        /// State the controller was in.
        state: SessionState,
    },

    /// A word of the binary stream could not be decoded.
    #[error("Stream decode error: {0}")]
    Decode(String),

    /// The stream went silent while looking for a scan boundary.
    #[error("Timed out waiting for a scan boundary")]
    SyncTimeout,

    /// Too many bytes were discarded without finding a scan boundary.
    #[error("No scan boundary found after discarding {discarded} bytes")]
    SyncLost {
        /// Number of bytes discarded before giving up.
        discarded: usize,
    },

    /// The acquisition task did not hand the transport back within the grace interval.
    #[error("Acquisition loop did not stop within {0:?}")]
    StopTimedOut(Duration),

    /// The blocking task running serial I/O panicked or was cancelled.
    #[error("Serial I/O task failed: {0}")]
    TaskJoin(String),

    /// A frame with the wrong number of channels was offered to the ring buffer.
    #[error("Frame has {got} channels, buffer expects {expected}")]
    FrameWidthMismatch {
        /// Channel count of the buffer.
        expected: usize,
        /// Channel count of the rejected frame.
        got: usize,
    },

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Figment(#[from] figment::Error),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error outside the transport boundary (opening a port, reading files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Real serial ports were compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl DaqError {
    /// Whether the acquisition session can continue after this error.
    ///
    /// Closed ports and lost transports end the session; everything else leaves the
    /// controller usable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DaqError::PortClosed | DaqError::TransportUnavailable | DaqError::TaskJoin(_)
        )
    }
}
