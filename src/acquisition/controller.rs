//! Session state machine over a serial transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::worker::AcquisitionLoop;
use super::{
    validate_scan_list, AcquisitionSettings, AcquisitionStatus, ChannelConfig, ConfigureReport,
    DeviceDescriptor, SessionState,
};
use crate::data::RingBuffer;
use crate::error::{AppResult, DaqError};
use crate::hardware::port::PortIo;
use crate::hardware::transport::{Reply, SerialTransport};
use crate::protocol::command::{
    encode_start, encode_stop, CommandFrame, QueryCode, RateConfig,
};
use crate::protocol::stream::{SampleDecoder, StreamSynchronizer};

struct RunningTask<P: PortIo> {
    running: Arc<AtomicBool>,
    handle: JoinHandle<SerialTransport<P>>,
}

/// Drives a DI-245 through configure, start and stop.
///
/// All serial I/O runs on tokio's blocking pool. The controller holds the transport while
/// idle; `start` moves it into the acquisition loop and `stop` takes it back.
///
/// # Example
///
/// ```no_run
/// use di245_daq::acquisition::{AcquisitionController, AcquisitionSettings, ChannelConfig};
/// use di245_daq::hardware::MockPort;
/// use di245_daq::protocol::{GainCode, RateConfig};
///
/// # async fn run() -> di245_daq::error::AppResult<()> {
/// let mut daq = AcquisitionController::new(MockPort::simulator(), AcquisitionSettings::default());
/// daq.initialize().await?;
/// daq.configure(vec![ChannelConfig::new(0, 0, GainCode::Volts5)], RateConfig::default())
///     .await?;
/// daq.start().await?;
/// // ... read daq.buffer() ...
/// daq.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct AcquisitionController<P: PortIo> {
    settings: AcquisitionSettings,
    state: SessionState,
    transport: Option<SerialTransport<P>>,
    channels: Vec<ChannelConfig>,
    rate: Option<RateConfig>,
    descriptor: Option<DeviceDescriptor>,
    buffer: Option<Arc<RingBuffer>>,
    task: Option<RunningTask<P>>,
    status: Arc<watch::Sender<AcquisitionStatus>>,
}

impl<P: PortIo> AcquisitionController<P> {
    /// Take ownership of an opened port.
    pub fn new(port: P, settings: AcquisitionSettings) -> Self {
        let transport = SerialTransport::new(port).with_read_timeout(settings.query_timeout);
        let (status, _) = watch::channel(AcquisitionStatus::default());
        Self {
            settings,
            state: SessionState::Uninitialized,
            transport: Some(transport),
            channels: Vec::new(),
            rate: None,
            descriptor: None,
            buffer: None,
            task: None,
            status: Arc::new(status),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Settings the controller was built with.
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Accepted scan list, in scan order.
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    /// Accepted rate.
    pub fn rate(&self) -> Option<RateConfig> {
        self.rate
    }

    /// Descriptor read by [`initialize`](Self::initialize).
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Ring buffer of the current configuration.
    pub fn buffer(&self) -> Option<Arc<RingBuffer>> {
        self.buffer.clone()
    }

    /// Latest loop status.
    pub fn status(&self) -> AcquisitionStatus {
        self.status.borrow().clone()
    }

    /// Receive loop status updates.
    pub fn subscribe_status(&self) -> watch::Receiver<AcquisitionStatus> {
        self.status.subscribe()
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> AppResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DaqError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: SessionState) {
        info!("Session state: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run `f` with the transport on the blocking pool.
    ///
    /// If the task panics the transport is lost and later calls fail with
    /// [`DaqError::TransportUnavailable`].
    async fn with_transport<T, F>(&mut self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SerialTransport<P>) -> AppResult<T> + Send + 'static,
    {
        let mut transport = self.transport.take().ok_or(DaqError::TransportUnavailable)?;
        let (transport, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut transport);
            (transport, result)
        })
        .await
        .map_err(|e| DaqError::TaskJoin(e.to_string()))?;
        self.transport = Some(transport);
        result
    }

    /// Stop any stream left over from a previous session and read the device descriptor.
    ///
    /// The descriptor is cached; later calls return it without touching the port.
    pub async fn initialize(&mut self) -> AppResult<DeviceDescriptor> {
        if let Some(descriptor) = &self.descriptor {
            return Ok(descriptor.clone());
        }
        self.require(
            "initialize",
            &[
                SessionState::Uninitialized,
                SessionState::Configured,
                SessionState::Stopped,
            ],
        )?;

        let descriptor = self
            .with_transport(|t| {
                if !t.write_frame(&encode_stop())? {
                    warn!("Stop command could not be sent before initialization");
                }
                t.flush()?;
                Ok(DeviceDescriptor {
                    name: query_field(t, QueryCode::DeviceName)?,
                    firmware_version: query_field(t, QueryCode::FirmwareVersion)?,
                    calibration_date: query_field(t, QueryCode::CalibrationDate)?,
                    serial_number: query_field(t, QueryCode::SerialNumber)?,
                })
            })
            .await?;

        info!(device = %descriptor, "Device identified");
        self.descriptor = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// Send the scan list and rate to the device.
    ///
    /// Channel echo mismatches are logged and reported per channel without aborting.
    /// The session moves to CONFIGURED only if the rate command is accepted; otherwise the
    /// rate's error is returned and the state is unchanged.
    pub async fn configure(
        &mut self,
        channels: Vec<ChannelConfig>,
        rate: RateConfig,
    ) -> AppResult<ConfigureReport> {
        self.require(
            "configure",
            &[SessionState::Uninitialized, SessionState::Stopped],
        )?;
        validate_scan_list(&channels)?;

        let mut ordered = channels;
        ordered.sort_by_key(|c| c.scan_position);
        let frames = ordered
            .iter()
            .map(ChannelConfig::frame)
            .collect::<AppResult<Vec<CommandFrame>>>()?;
        let rate_frame = rate.encode();

        let (channel_results, rate_result) = self
            .with_transport(move |t| {
                let mut results = Vec::with_capacity(frames.len());
                for frame in &frames {
                    match t.send_verified(frame) {
                        Ok(()) => results.push(true),
                        Err(e) if e.is_terminal() => return Err(e),
                        Err(e) => {
                            warn!(error = %e, "Channel configuration not confirmed");
                            results.push(false);
                        }
                    }
                }
                match t.send_verified(&rate_frame) {
                    Err(e) if e.is_terminal() => Err(e),
                    other => Ok((results, other)),
                }
            })
            .await?;

        if let Err(e) = rate_result {
            error!(error = %e, "Rate configuration rejected, session left {}", self.state);
            return Err(e);
        }

        let report = ConfigureReport {
            channel_results,
            rate_ok: true,
        };
        info!(
            channels = ordered.len(),
            success_ratio = report.success_ratio(),
            rate = %rate,
            "Device configured"
        );

        let channel_count = ordered.len();
        let keep_buffer = self
            .buffer
            .as_ref()
            .is_some_and(|b| b.channel_count() == channel_count);
        if !keep_buffer {
            debug!(
                capacity = self.settings.buffer_capacity,
                channel_count, "Allocating ring buffer"
            );
            self.buffer = Some(Arc::new(RingBuffer::new(
                self.settings.buffer_capacity,
                channel_count,
            )?));
        }

        self.channels = ordered;
        self.rate = Some(rate);
        self.transition(SessionState::Configured);
        Ok(report)
    }

    /// Start streaming and launch the acquisition loop.
    ///
    /// If no scan boundary can be found the device is told to stop again and the session
    /// stays CONFIGURED.
    pub async fn start(&mut self) -> AppResult<()> {
        self.require("start", &[SessionState::Configured])?;
        let buffer = self.buffer.clone().ok_or(DaqError::InvalidState {
            operation: "start",
            state: self.state,
        })?;

        let channel_count = self.channels.len();
        let synchronizer = StreamSynchronizer::new(channel_count)
            .with_timeout(self.settings.read_timeout)
            .with_max_discard(self.settings.sync_max_discard);
        let decoder = SampleDecoder::new(channel_count)?;

        let sync = synchronizer.clone();
        let synced = self
            .with_transport(move |t| {
                t.flush()?;
                if !t.write_frame(&encode_start())? {
                    return Ok(Err(DaqError::CommandNotSent(encode_start().label())));
                }
                // The "S1" echo never fits the sync pattern, so the synchronizer skips it
                match sync.synchronize(t) {
                    Ok(report) => Ok(Ok(report)),
                    Err(e) if e.is_terminal() => Err(e),
                    Err(e) => {
                        t.write_frame(&encode_stop())?;
                        t.flush()?;
                        Ok(Err(e))
                    }
                }
            })
            .await?;

        let report = match synced {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Could not synchronize on the stream, device stopped");
                return Err(e);
            }
        };
        debug!(discarded = report.discarded, "Stream synchronized");

        let transport = self.transport.take().ok_or(DaqError::TransportUnavailable)?;
        let running = Arc::new(AtomicBool::new(true));
        self.status.send_replace(AcquisitionStatus {
            running: true,
            ..AcquisitionStatus::default()
        });

        let acquisition = AcquisitionLoop {
            decoder,
            synchronizer,
            buffer,
            running: Arc::clone(&running),
            status: Arc::clone(&self.status),
            packet_points: self.settings.packet_points,
            poll_interval: self.settings.poll_interval,
            read_timeout: self.settings.read_timeout,
            carry: report.boundary_scan,
        };
        let handle = tokio::task::spawn_blocking(move || acquisition.run(transport));
        self.task = Some(RunningTask { running, handle });

        self.transition(SessionState::Running);
        Ok(())
    }

    /// Stop the acquisition loop and the device stream.
    ///
    /// Fails with [`DaqError::StopTimedOut`] if the loop does not exit within the grace
    /// interval; the session stays RUNNING and `stop` may be called again. The loop sends
    /// the stop command itself once it exits, so the device does not keep streaming.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.require("stop", &[SessionState::Running])?;
        let grace = self.settings.stop_grace;
        let task = self.task.as_mut().ok_or(DaqError::TransportUnavailable)?;

        task.running.store(false, Ordering::SeqCst);
        let joined = match tokio::time::timeout(grace, &mut task.handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    ?grace,
                    "Acquisition loop still busy, device keeps streaming until it exits"
                );
                return Err(DaqError::StopTimedOut(grace));
            }
        };
        self.task = None;

        match joined {
            Ok(transport) => self.transport = Some(transport),
            Err(e) => {
                error!(error = %e, "Acquisition task failed, serial transport lost");
                self.transition(SessionState::Stopped);
                return Err(DaqError::TaskJoin(e.to_string()));
            }
        }

        let stopped = self
            .with_transport(|t| {
                if !t.write_frame(&encode_stop())? {
                    warn!("Stop command could not be sent");
                }
                t.flush()
            })
            .await;
        if let Err(e) = stopped {
            warn!(error = %e, "Device may still be streaming");
        }

        self.status.send_modify(|s| s.running = false);
        self.transition(SessionState::Stopped);
        Ok(())
    }

    /// Stop if running. Safe to call in any state.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        if self.state == SessionState::Running {
            self.stop().await?;
        }
        Ok(())
    }
}

impl<P: PortIo> Drop for AcquisitionController<P> {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.running.store(false, Ordering::SeqCst);
        }
    }
}

/// Send a descriptor query and return the value after the echoed command characters.
fn query_field<P: PortIo>(
    transport: &mut SerialTransport<P>,
    query: QueryCode,
) -> AppResult<String> {
    let frame = query.frame();
    match transport.query(&frame, None)? {
        Reply::Data(reply) if reply.starts_with(frame.echo()) => {
            let value = String::from_utf8_lossy(&reply[frame.echo().len()..])
                .trim()
                .to_string();
            debug!(query = %frame, %value, "Descriptor field");
            Ok(value)
        }
        Reply::Data(reply) => Err(DaqError::CommandEchoMismatch {
            command: frame.label(),
            sent: frame.echo().to_vec(),
            echoed: reply,
        }),
        Reply::TimedOut => Err(DaqError::CommandEchoMismatch {
            command: frame.label(),
            sent: frame.echo().to_vec(),
            echoed: Vec::new(),
        }),
        Reply::NotSent => Err(DaqError::CommandNotSent(frame.label())),
    }
}
