//! DI-245 Hardware Validation Tests
//!
//! These tests talk to a real DI-245 and are skipped unless `DI245_PORT` names its serial
//! port. Connect at least one input (channel 0) to a known source before running.
//!
//! Run with: DI245_PORT=/dev/ttyUSB0 cargo test --features "hardware_tests,instrument_serial"
//!           --test hardware_di245 -- --test-threads=1 --nocapture

#![cfg(all(feature = "hardware_tests", feature = "instrument_serial"))]

use di245_daq::hardware::{open_port, PortIo};
use di245_daq::protocol::{GainCode, RateConfig};
use di245_daq::{AcquisitionController, AcquisitionSettings, ChannelConfig, SessionState};
use serial_test::serial;
use std::time::{Duration, Instant};

fn hardware_port() -> Option<Box<dyn PortIo>> {
    let Ok(path) = std::env::var("DI245_PORT") else {
        println!("DI245_PORT not set, skipping hardware test");
        return None;
    };
    Some(open_port(&path).unwrap_or_else(|e| panic!("cannot open {path}: {e}")))
}

#[tokio::test]
#[serial]
async fn identity_reports_descriptor() {
    let Some(port) = hardware_port() else { return };
    let mut daq = AcquisitionController::new(port, AcquisitionSettings::default());

    let descriptor = daq.initialize().await.unwrap();
    println!("Connected to {descriptor}");
    assert!(!descriptor.name.is_empty());
    assert!(!descriptor.serial_number.is_empty());
    daq.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn acquisition_streams_for_two_seconds() {
    let Some(port) = hardware_port() else { return };
    let mut daq = AcquisitionController::new(port, AcquisitionSettings::default());
    daq.initialize().await.unwrap();

    let channels = vec![
        ChannelConfig::new(0, 0, GainCode::Volts5),
        ChannelConfig::new(1, 1, GainCode::Volts5),
    ];
    let report = daq
        .configure(channels, RateConfig::nearest(100.0).unwrap())
        .await
        .unwrap();
    assert!(report.all_ok(), "channel configuration rejected: {report:?}");

    daq.start().await.unwrap();
    assert_eq!(daq.state(), SessionState::Running);

    let started = Instant::now();
    tokio::time::sleep(Duration::from_secs(2)).await;
    daq.stop().await.unwrap();
    let elapsed = started.elapsed().as_secs_f64();

    let status = daq.status();
    println!("{status:?}");
    assert!(status.fault.is_none());
    let frames = daq.buffer().unwrap().len();
    // Roughly 100 Hz, allowing for the final partial packet
    assert!(frames as f64 > 50.0 * elapsed, "only {frames} frames in {elapsed:.2} s");

    daq.shutdown().await.unwrap();
}
