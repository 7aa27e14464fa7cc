//! Acquisition session: configuration, start/stop state machine and the background loop.
//!
//! ```text
//! UNINITIALIZED --configure--> CONFIGURED --start--> RUNNING --stop--> STOPPED
//!                                  ^                                     |
//!                                  +-------------configure---------------+
//! ```
//!
//! [`AcquisitionController`] owns the session state and the serial transport. While running,
//! the transport is moved into the blocking acquisition task and handed back when it exits.

mod controller;
mod worker;

pub use controller::AcquisitionController;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::protocol::command::{encode_channel_config, CommandFrame, GainCode};

/// Lifecycle state of an acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No configuration has been accepted yet.
    Uninitialized,
    /// Channels and rate are set on the device.
    Configured,
    /// The device is streaming and the acquisition loop is active.
    Running,
    /// Streaming was stopped; the device can be reconfigured.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "UNINITIALIZED",
            SessionState::Configured => "CONFIGURED",
            SessionState::Running => "RUNNING",
            SessionState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// One active channel of the scan list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Position in the scan cycle (0-based).
    pub scan_position: u8,
    /// Physical input (0-15).
    pub physical_channel: u8,
    /// Range or thermocouple type.
    pub code: GainCode,
}

impl ChannelConfig {
    /// Describe one scan list entry.
    pub fn new(scan_position: u8, physical_channel: u8, code: GainCode) -> Self {
        Self {
            scan_position,
            physical_channel,
            code,
        }
    }

    /// The `chn` frame for this entry.
    pub fn frame(&self) -> AppResult<CommandFrame> {
        encode_channel_config(self.scan_position, self.physical_channel, self.code)
    }
}

/// Check that scan positions are exactly `0..N-1` with no duplicates.
pub fn validate_scan_list(channels: &[ChannelConfig]) -> AppResult<()> {
    if channels.is_empty() {
        return Err(DaqError::InvalidScanList(
            "at least one channel is required".to_string(),
        ));
    }

    let mut positions = BTreeSet::new();
    for channel in channels {
        if !positions.insert(channel.scan_position) {
            return Err(DaqError::InvalidScanList(format!(
                "scan position {} is used twice",
                channel.scan_position
            )));
        }
    }

    let expected = channels.len();
    if positions.iter().copied().map(usize::from).ne(0..expected) {
        return Err(DaqError::InvalidScanList(format!(
            "scan positions {:?} are not contiguous from 0 to {}",
            positions,
            expected - 1
        )));
    }
    Ok(())
}

/// Identification strings read once per session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// Device name (`A1`).
    pub name: String,
    /// Firmware version (`A2`).
    pub firmware_version: String,
    /// Last calibration date, hex encoded (`A7`).
    pub calibration_date: String,
    /// Serial number (`NZ`).
    pub serial_number: String,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DI-{} (firmware {}, calibrated {}, S/N {})",
            self.name, self.firmware_version, self.calibration_date, self.serial_number
        )
    }
}

/// Outcome of [`AcquisitionController::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureReport {
    /// Echo verification result per channel, in scan order.
    pub channel_results: Vec<bool>,
    /// Whether the rate command was accepted.
    pub rate_ok: bool,
}

impl ConfigureReport {
    /// Fraction of channel commands the device accepted.
    pub fn success_ratio(&self) -> f64 {
        if self.channel_results.is_empty() {
            return 0.0;
        }
        let ok = self.channel_results.iter().filter(|ok| **ok).count();
        ok as f64 / self.channel_results.len() as f64
    }

    /// Whether every channel and the rate were accepted.
    pub fn all_ok(&self) -> bool {
        self.rate_ok && self.channel_results.iter().all(|ok| *ok)
    }
}

/// Timing and sizing of an acquisition session.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Scans decoded per block.
    pub packet_points: usize,
    /// Ring buffer capacity in scans.
    pub buffer_capacity: usize,
    /// Sleep between buffer polls when a block is not yet available.
    pub poll_interval: Duration,
    /// How long `stop` waits for the loop to hand the transport back.
    pub stop_grace: Duration,
    /// Timeout for command echoes and descriptor queries.
    pub query_timeout: Duration,
    /// Timeout for stream reads (synchronization and blocks).
    pub read_timeout: Duration,
    /// Bytes discarded while synchronizing before giving up.
    pub sync_max_discard: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            packet_points: 10,
            buffer_capacity: 4_320_000,
            poll_interval: Duration::from_millis(10),
            stop_grace: Duration::from_secs(1),
            query_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_secs(1),
            sync_max_discard: crate::protocol::stream::DEFAULT_MAX_DISCARD,
        }
    }
}

/// Progress and health of the acquisition loop, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcquisitionStatus {
    /// Whether the loop is active.
    pub running: bool,
    /// Blocks decoded since start.
    pub blocks_decoded: u64,
    /// Frames appended to the ring buffer since start.
    pub frames_appended: u64,
    /// Words zero-filled because they were missing.
    pub decode_errors: u64,
    /// Blocks discarded because their framing bits were out of place.
    pub blocks_dropped: u64,
    /// Resynchronizations performed after misaligned blocks.
    pub resyncs: u64,
    /// Terminal fault that ended the loop, if any.
    pub fault: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(position: u8) -> ChannelConfig {
        ChannelConfig::new(position, position, GainCode::Volts5)
    }

    #[test]
    fn test_scan_list_validation() {
        assert!(validate_scan_list(&[channel(0)]).is_ok());
        assert!(validate_scan_list(&[channel(1), channel(0), channel(2)]).is_ok());

        for bad in [
            vec![],
            vec![channel(1)],
            vec![channel(0), channel(0)],
            vec![channel(0), channel(2)],
        ] {
            assert!(
                matches!(validate_scan_list(&bad), Err(DaqError::InvalidScanList(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_success_ratio() {
        let report = ConfigureReport {
            channel_results: vec![true, false, true, true],
            rate_ok: true,
        };
        assert!((report.success_ratio() - 0.75).abs() < f64::EPSILON);
        assert!(!report.all_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Uninitialized.to_string(), "UNINITIALIZED");
        assert_eq!(SessionState::Stopped.to_string(), "STOPPED");
    }
}
