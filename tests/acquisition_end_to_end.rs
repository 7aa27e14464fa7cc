//! End-to-end acquisition against the mock DI-245
//!
//! These tests drive the full path: configuration frames and echo verification, start,
//! synchronization, block decoding in the background loop and retrieval through the ring
//! buffer.

mod common;

use common::{fast_settings, wait_for_frames, wait_for_status};
use di245_daq::hardware::MockPort;
use di245_daq::protocol::stream::encode_scan;
use di245_daq::protocol::{GainCode, RateConfig};
use di245_daq::{AcquisitionController, ChannelConfig, SampleFrame, SessionState};

fn two_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::new(0, 0, GainCode::ThermocoupleN),
        ChannelConfig::new(1, 1, GainCode::Volts1),
    ]
}

#[tokio::test]
async fn test_two_channel_stream_reaches_buffer_in_order() {
    let port = MockPort::di245();
    // Three scans, words written out by hand with the marker bit clear:
    // [8192, 100], [16383, 4000], [1, 12345]
    let stream: Vec<u8> = [
        0x8000u16, 0x00C9, //
        0xFEFE, 0x3E41, //
        0x0002, 0xC073,
    ]
    .iter()
    .flat_map(|w| w.to_le_bytes())
    .collect();
    port.preload_stream(&stream);

    let mut daq = AcquisitionController::new(port.clone(), fast_settings(3));
    let report = daq
        .configure(two_channels(), RateConfig::default())
        .await
        .unwrap();
    assert!(report.all_ok());
    assert_eq!(daq.state(), SessionState::Configured);

    let commands = port.commands();
    assert_eq!(commands[0], b"chn 0 5120 \r");
    assert_eq!(commands[1], b"chn 1 3329 \r");
    assert_eq!(commands[2], b"xrate 1871 10 \r");

    daq.start().await.unwrap();
    assert_eq!(daq.state(), SessionState::Running);

    let buffer = daq.buffer().unwrap();
    assert!(wait_for_frames(&buffer, 3).await, "frames never arrived");
    daq.stop().await.unwrap();
    assert_eq!(daq.state(), SessionState::Stopped);

    assert_eq!(
        buffer.snapshot(3),
        vec![
            SampleFrame::new(vec![8192, 100]),
            SampleFrame::new(vec![16383, 4000]),
            SampleFrame::new(vec![1, 12345]),
        ]
    );
    let status = daq.status();
    assert_eq!(status.blocks_decoded, 1);
    assert_eq!(status.frames_appended, 3);
    assert_eq!(status.blocks_dropped, 0);
    assert!(!status.running);
    assert!(!port.is_streaming());
}

#[tokio::test]
async fn test_first_scan_after_start_is_kept() {
    let port = MockPort::new();
    let mut stream = encode_scan(&[100, 200]);
    stream.extend(encode_scan(&[300, 400]));
    stream.extend(encode_scan(&[500, 600]));
    port.preload_stream(&stream);

    let mut daq = AcquisitionController::new(port, fast_settings(1));
    daq.configure(two_channels(), RateConfig::default())
        .await
        .unwrap();
    daq.start().await.unwrap();

    let buffer = daq.buffer().unwrap();
    assert!(wait_for_frames(&buffer, 3).await, "frames never arrived");
    daq.stop().await.unwrap();

    assert_eq!(
        buffer.snapshot(3),
        vec![
            SampleFrame::new(vec![100, 200]),
            SampleFrame::new(vec![300, 400]),
            SampleFrame::new(vec![500, 600]),
        ]
    );
}

#[tokio::test]
async fn test_stream_with_marker_bit_clear() {
    let port = MockPort::new();
    let word = |value: u16, first: bool| -> [u8; 2] {
        let sync = u16::from(!first);
        ((((value >> 7) & 0x7F) << 9) | ((value & 0x7F) << 1) | sync).to_le_bytes()
    };
    let mut stream = Vec::new();
    for i in 0..5u16 {
        stream.extend(word(10 * i, true));
        stream.extend(word(10 * i + 1, false));
    }
    port.preload_stream(&stream);

    let mut daq = AcquisitionController::new(port, fast_settings(1));
    daq.configure(two_channels(), RateConfig::default())
        .await
        .unwrap();
    daq.start().await.unwrap();

    let buffer = daq.buffer().unwrap();
    assert!(wait_for_frames(&buffer, 5).await, "frames never arrived");
    daq.stop().await.unwrap();

    let status = daq.status();
    assert_eq!(status.blocks_dropped, 0);
    assert_eq!(status.resyncs, 0);
    let values: Vec<Vec<u16>> = buffer
        .drain_all()
        .into_iter()
        .map(SampleFrame::into_values)
        .collect();
    assert_eq!(
        values,
        vec![vec![0, 1], vec![10, 11], vec![20, 21], vec![30, 31], vec![40, 41]]
    );
}

#[tokio::test]
async fn test_misaligned_block_triggers_resync() {
    let port = MockPort::new();
    let scan = |i: u16| encode_scan(&[i, 100 + i]);
    let mut stream = Vec::new();
    for i in 0..3 {
        stream.extend(scan(i));
    }
    // A stray byte shifts everything after it
    stream.push(0xFF);
    for i in 3..80 {
        stream.extend(scan(i));
    }
    port.preload_stream(&stream);

    let mut daq = AcquisitionController::new(port, fast_settings(2));
    let channels = vec![
        ChannelConfig::new(0, 0, GainCode::Volts5),
        ChannelConfig::new(1, 1, GainCode::Volts5),
    ];
    daq.configure(channels, RateConfig::default()).await.unwrap();
    daq.start().await.unwrap();

    let status = wait_for_status(&daq, |s| s.resyncs >= 1 && s.blocks_decoded >= 2).await;
    daq.stop().await.unwrap();

    assert_eq!(status.blocks_dropped, 1);
    assert_eq!(status.resyncs, 1);
    let values: Vec<Vec<u16>> = daq
        .buffer()
        .unwrap()
        .drain_all()
        .into_iter()
        .map(SampleFrame::into_values)
        .collect();
    // The block holding the stray byte is dropped; everything else arrives intact
    assert_eq!(values[..2], [vec![0, 100], vec![1, 101]]);
    assert!(values.len() >= 4);
    let resumed = values[2][0];
    assert!(resumed > 3);
    for (k, frame) in values[2..].iter().enumerate() {
        let i = resumed + k as u16;
        assert_eq!(frame, &vec![i, 100 + i]);
    }
}

#[tokio::test]
async fn test_disconnect_ends_loop_with_fault() {
    let port = MockPort::new();
    port.preload_stream(&encode_scan(&[0]).repeat(3));

    let mut daq = AcquisitionController::new(port.clone(), fast_settings(10));
    daq.configure(
        vec![ChannelConfig::new(0, 2, GainCode::ThermocoupleK)],
        RateConfig::default(),
    )
    .await
    .unwrap();
    daq.start().await.unwrap();

    port.disconnect();
    let status = wait_for_status(&daq, |s| s.fault.is_some()).await;
    assert!(!status.running);
    assert!(status
        .fault
        .as_deref()
        .is_some_and(|f| f.contains("closed")));

    // Stop still hands the session back even though the stop command cannot be sent
    daq.stop().await.unwrap();
    assert_eq!(daq.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_simulated_device_streams_continuously() {
    let port = MockPort::simulator();
    let mut daq = AcquisitionController::new(port, fast_settings(10));
    let descriptor = daq.initialize().await.unwrap();
    assert_eq!(descriptor.name, "2450");

    // SF=0, AF=0 gives the fastest burst rate
    daq.configure(two_channels(), RateConfig::from_divisors(0, 0))
        .await
        .unwrap();
    daq.start().await.unwrap();

    let buffer = daq.buffer().unwrap();
    assert!(wait_for_frames(&buffer, 50).await);
    daq.stop().await.unwrap();

    let status = daq.status();
    assert_eq!(status.blocks_dropped, 0);
    assert_eq!(status.decode_errors, 0);
    assert!(buffer
        .drain_all()
        .iter()
        .all(|f| f.len() == 2 && f.values().iter().all(|&v| v <= 0x3FFF)));
}
