//! # DI-245 Acquisition Driver
//!
//! Serial protocol driver for the DATAQ DI-245 four-channel voltage/thermocouple data
//! acquisition device: command encoding, bit synchronization on the binary scan stream,
//! sample decoding and bounded in-memory buffering of decoded scans.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: pure encoding of command frames (`chn`, `xrate`, short queries) and the
//!   stream synchronizer/decoder.
//! - **`hardware`**: the [`PortIo`](hardware::PortIo) handle trait, the real serial port, the
//!   blocking [`SerialTransport`](hardware::SerialTransport) and a mock DI-245.
//! - **`acquisition`**: the [`AcquisitionController`] state machine and its background loop.
//! - **`data`**: [`SampleFrame`] and the fixed-capacity [`RingBuffer`].
//! - **`config`**: Figment-based TOML + environment configuration.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`error`**: the crate-wide [`DaqError`] type.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod protocol;

pub use acquisition::{
    AcquisitionController, AcquisitionSettings, AcquisitionStatus, ChannelConfig,
    ConfigureReport, DeviceDescriptor, SessionState,
};
pub use config::DaqConfig;
pub use data::{RingBuffer, SampleFrame};
pub use error::{AppResult, DaqError};
