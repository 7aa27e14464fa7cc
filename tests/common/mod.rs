//! Shared helpers for the mock-device integration tests.

#![allow(dead_code)]

use di245_daq::acquisition::AcquisitionStatus;
use di245_daq::{AcquisitionController, AcquisitionSettings, RingBuffer};
use di245_daq::hardware::MockPort;
use std::time::{Duration, Instant};

/// Fast settings so tests finish quickly.
pub fn fast_settings(packet_points: usize) -> AcquisitionSettings {
    AcquisitionSettings {
        packet_points,
        buffer_capacity: 1024,
        poll_interval: Duration::from_millis(1),
        stop_grace: Duration::from_secs(2),
        query_timeout: Duration::from_millis(100),
        read_timeout: Duration::from_millis(200),
        sync_max_discard: 512,
    }
}

/// Wait until `buffer` holds at least `frames` frames.
pub async fn wait_for_frames(buffer: &RingBuffer, frames: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if buffer.len() >= frames {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Wait until the published status satisfies `done`.
pub async fn wait_for_status<F>(daq: &AcquisitionController<MockPort>, done: F) -> AcquisitionStatus
where
    F: Fn(&AcquisitionStatus) -> bool,
{
    let mut rx = daq.subscribe_status();
    let _ = tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| done(s))).await;
    let status = rx.borrow().clone();
    status
}
