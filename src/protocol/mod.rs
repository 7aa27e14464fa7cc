//! DI-245 wire protocol.
//!
//! [`command`] encodes the ASCII command frames, [`stream`] synchronizes on and decodes the
//! binary scan stream. Neither module owns a port.

pub mod command;
pub mod stream;

pub use command::{CommandFrame, GainCode, QueryCode, RateConfig};
pub use stream::{DecodedBlock, SampleDecoder, StreamSynchronizer, SyncReport};
