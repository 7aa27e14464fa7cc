//! Serial transport for the DI-245.
//!
//! Wraps an opened [`PortIo`] handle and provides the write/read/query primitives the
//! protocol layers are built on. Error policy:
//!
//! - A closed handle is the only hard error ([`DaqError::PortClosed`]).
//! - I/O faults during a write are logged and reported as `Ok(false)`.
//! - Reads that do not complete in time return [`Reply::TimedOut`].
//!
//! All calls block; async callers run them through `tokio::task::spawn_blocking`.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::port::PortIo;
use crate::protocol::command::CommandFrame;

/// Default timeout for query responses and configuration echoes.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Sleep between `bytes_to_read` polls while waiting for a counted read.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Outcome of a read or query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bytes received.
    Data(Vec<u8>),
    /// Nothing (or not enough) arrived before the timeout.
    TimedOut,
    /// The request could not be written, so no read was attempted.
    NotSent,
}

impl Reply {
    /// Received bytes, if any.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Reply::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Consume into the received bytes, if any.
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Reply::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Whether the read expired.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Reply::TimedOut)
    }
}

/// Blocking byte transport over a serial handle.
pub struct SerialTransport<P: PortIo> {
    port: P,
    read_timeout: Duration,
    poll_interval: Duration,
}

impl<P: PortIo> SerialTransport<P> {
    /// Wrap an opened handle with default timeouts.
    pub fn new(port: P) -> Self {
        Self {
            port,
            read_timeout: DEFAULT_READ_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the timeout used by [`query`](Self::query).
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the sleep between availability polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Timeout used by [`query`](Self::query).
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Borrow the underlying handle.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Give back the underlying handle.
    pub fn into_inner(self) -> P {
        self.port
    }

    /// Whether the handle is still usable.
    pub fn is_open(&self) -> bool {
        self.port.is_open()
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.port.is_open() {
            Ok(())
        } else {
            Err(DaqError::PortClosed)
        }
    }

    fn clear_buffers(&mut self) -> std::io::Result<()> {
        self.port.clear_input()?;
        self.port.clear_output()
    }

    /// Flush both buffers, then write `bytes`.
    ///
    /// Returns `Ok(false)` when the write failed for any reason other than a closed port.
    pub fn write(&mut self, bytes: &[u8]) -> AppResult<bool> {
        self.ensure_open()?;

        if let Err(e) = self.clear_buffers() {
            error!(error = %e, "Failed to flush serial buffers before write");
            return Ok(false);
        }

        let result = self
            .port
            .write_all(bytes)
            .and_then(|_| self.port.flush());
        match result {
            Ok(()) => {
                debug!("Sent serial command: {:?}", String::from_utf8_lossy(bytes));
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, "Serial write failed");
                Ok(false)
            }
        }
    }

    /// Write an encoded command frame.
    pub fn write_frame(&mut self, frame: &CommandFrame) -> AppResult<bool> {
        self.write(frame.as_bytes())
    }

    /// Read from the port.
    ///
    /// With `count == None` this reads until a CR or LF (included in the result) or until
    /// `timeout`, returning whatever arrived. With a count it waits until that many bytes
    /// are buffered and then reads exactly that many.
    pub fn read(&mut self, count: Option<usize>, timeout: Duration) -> AppResult<Reply> {
        match count {
            None => self.read_line(timeout),
            Some(n) => self.read_exact_within(n, timeout),
        }
    }

    fn read_line(&mut self, timeout: Duration) -> AppResult<Reply> {
        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            self.ensure_open()?;
            let got_byte = match self.port.read(&mut byte) {
                Ok(0) => false,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\r' || byte[0] == b'\n' {
                        break;
                    }
                    true
                }
                Err(e) if is_soft(e.kind()) => false,
                Err(e) => {
                    self.ensure_open()?;
                    warn!(error = %e, "Serial read error");
                    break;
                }
            };

            if Instant::now() >= deadline {
                break;
            }
            if !got_byte {
                thread::sleep(self.poll_interval);
            }
        }

        if line.is_empty() {
            Ok(Reply::TimedOut)
        } else {
            debug!("Received serial response: {:?}", String::from_utf8_lossy(&line));
            Ok(Reply::Data(line))
        }
    }

    fn read_exact_within(&mut self, count: usize, timeout: Duration) -> AppResult<Reply> {
        if count == 0 {
            return Ok(Reply::Data(Vec::new()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            match self.port.bytes_to_read() {
                Ok(available) if available as usize >= count => break,
                Ok(_) => {}
                Err(e) => {
                    self.ensure_open()?;
                    debug!(error = %e, "bytes_to_read failed while waiting for data");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Reply::TimedOut);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }

        let mut buffer = vec![0u8; count];
        match self.port.read_exact(&mut buffer) {
            Ok(()) => Ok(Reply::Data(buffer)),
            Err(e) => {
                self.ensure_open()?;
                warn!(error = %e, expected = count, "Bounded serial read failed");
                Ok(Reply::TimedOut)
            }
        }
    }

    /// Write `frame`, then read the response with the configured read timeout.
    pub fn query(&mut self, frame: &CommandFrame, expected: Option<usize>) -> AppResult<Reply> {
        if !self.write_frame(frame)? {
            return Ok(Reply::NotSent);
        }
        self.read(expected, self.read_timeout)
    }

    /// Send a command and check that the device echoes it back unchanged.
    pub fn send_verified(&mut self, frame: &CommandFrame) -> AppResult<()> {
        let expected = frame.echo();
        match self.query(frame, Some(expected.len()))? {
            Reply::Data(echoed) if echoed == expected => Ok(()),
            Reply::Data(echoed) => Err(DaqError::CommandEchoMismatch {
                command: frame.label(),
                sent: expected.to_vec(),
                echoed,
            }),
            Reply::TimedOut => Err(DaqError::CommandEchoMismatch {
                command: frame.label(),
                sent: expected.to_vec(),
                echoed: Vec::new(),
            }),
            Reply::NotSent => Err(DaqError::CommandNotSent(frame.label())),
        }
    }

    /// Discard pending input and output.
    pub fn flush(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        if let Err(e) = self.clear_buffers() {
            warn!(error = %e, "Failed to flush serial buffers");
        }
        Ok(())
    }

    /// `(input, output)` byte counts, or `None` when the port cannot be queried.
    pub fn bytes_waiting(&self) -> Option<(u32, u32)> {
        let input = self.port.bytes_to_read();
        let output = self.port.bytes_to_write();
        match (input, output) {
            (Ok(input), Ok(output)) => Some((input, output)),
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "Could not query serial buffer levels");
                None
            }
        }
    }
}

fn is_soft(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}
