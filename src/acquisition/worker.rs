//! The blocking acquisition loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::AcquisitionStatus;
use crate::data::RingBuffer;
use crate::error::{AppResult, DaqError};
use crate::hardware::port::PortIo;
use crate::hardware::transport::SerialTransport;
use crate::protocol::command::encode_stop;
use crate::protocol::stream::{SampleDecoder, StreamSynchronizer};

/// Everything the loop needs, moved into the blocking task.
pub(crate) struct AcquisitionLoop {
    pub decoder: SampleDecoder,
    pub synchronizer: StreamSynchronizer,
    pub buffer: Arc<RingBuffer>,
    pub running: Arc<AtomicBool>,
    pub status: Arc<watch::Sender<AcquisitionStatus>>,
    pub packet_points: usize,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    /// Bytes already taken from the port that start the next block (the boundary scan
    /// found by the last synchronization).
    pub carry: Vec<u8>,
}

impl AcquisitionLoop {
    /// Poll, decode and store blocks until the running flag clears or the port is lost.
    ///
    /// When the loop ends because the running flag was cleared, the device is told to stop
    /// before the transport is handed back, so a stop that timed out still halts the stream.
    pub fn run<P: PortIo>(mut self, mut transport: SerialTransport<P>) -> SerialTransport<P> {
        let block_len = self.decoder.block_len(self.packet_points);
        info!(
            channels = self.decoder.channel_count(),
            packet_points = self.packet_points,
            block_len,
            "Acquisition loop started"
        );

        while self.running.load(Ordering::SeqCst) {
            match self.step(&mut transport, block_len) {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.poll_interval),
                Err(e) => {
                    error!(error = %e, "Acquisition loop terminated");
                    self.status.send_modify(|s| s.fault = Some(e.to_string()));
                    break;
                }
            }
        }

        if !self.running.load(Ordering::SeqCst) && transport.is_open() {
            match transport.write_frame(&encode_stop()) {
                Ok(true) => debug!("Stop command sent from acquisition loop"),
                Ok(false) | Err(_) => warn!("Stop command could not be sent from acquisition loop"),
            }
        }

        self.status.send_modify(|s| s.running = false);
        info!("Acquisition loop exited");
        transport
    }

    /// One poll. `Ok(true)` when a block was consumed, `Ok(false)` when there was nothing
    /// to do yet. Only errors that end the session are returned.
    fn step<P: PortIo>(
        &mut self,
        transport: &mut SerialTransport<P>,
        block_len: usize,
    ) -> AppResult<bool> {
        let Some((input, _)) = transport.bytes_waiting() else {
            if transport.is_open() {
                return Ok(false);
            }
            return Err(DaqError::PortClosed);
        };
        if (input as usize) + self.carry.len() < block_len {
            return Ok(false);
        }

        let block = self.decoder.decode_after(
            transport,
            &self.carry,
            self.packet_points,
            self.read_timeout,
        )?;
        if block.timed_out {
            warn!("Block announced by the port did not arrive in time");
            return Ok(false);
        }
        self.carry.clear();

        if block.needs_resync() {
            warn!(
                misaligned = block.misaligned_words,
                "Stream lost alignment, dropping block and resynchronizing"
            );
            self.status.send_modify(|s| s.blocks_dropped += 1);
            match self.synchronizer.synchronize(transport) {
                Ok(report) => {
                    debug!(discarded = report.discarded, "Resynchronized");
                    self.carry = report.boundary_scan;
                    self.status.send_modify(|s| s.resyncs += 1);
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => warn!(error = %e, "Resynchronization failed, will retry"),
            }
            return Ok(true);
        }

        let appended = block.frames.len() as u64;
        if let Err(e) = self.buffer.append_block(&block.frames) {
            error!(error = %e, "Decoded block rejected by ring buffer");
            return Ok(true);
        }

        let zero_filled = block.decode_errors as u64;
        self.status.send_modify(|s| {
            s.blocks_decoded += 1;
            s.frames_appended += appended;
            s.decode_errors += zero_filled;
        });
        Ok(true)
    }
}
