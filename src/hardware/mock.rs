//! Mock DI-245
//!
//! An in-process emulation of the device that implements [`PortIo`], for tests and for
//! running the CLI without hardware (`--simulate`).
//!
//! What it emulates:
//!
//! - Long commands are echoed in full once their CR arrives, short `\0XY` commands echo `XY`.
//! - Descriptor queries answer with scripted replies (see [`MockPort::di245`]).
//! - `S1` switches streaming on and releases any preloaded stream bytes; `S0` switches it off.
//! - In simulator mode, `chn`/`xrate` commands are parsed and, while streaming, scans are
//!   generated at the configured burst rate.
//!
//! Clones share the same device state, so a test keeps one clone as a handle for feeding
//! bytes, injecting faults and inspecting what was written.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::hardware::port::PortIo;
use crate::protocol::command::RateConfig;
use crate::protocol::stream::encode_scan;

/// Descriptor replies of the emulated unit.
pub const MOCK_DEVICE_NAME: &str = "2450";
/// Firmware version reported by the mock.
pub const MOCK_FIRMWARE: &str = "8A";
/// Calibration date reported by the mock, hex encoded.
pub const MOCK_CALIBRATION_DATE: &str = "7E40C1";
/// Serial number reported by the mock.
pub const MOCK_SERIAL_NUMBER: &str = "5A3B1C02";

/// Upper bound on scans emitted per poll in simulator mode.
const MAX_SCANS_PER_POLL: u64 = 2_000;

struct Simulator {
    channels: BTreeMap<u8, u16>,
    burst_hz: f64,
    started: Option<Instant>,
    emitted: u64,
}

impl Simulator {
    fn new() -> Self {
        Self {
            channels: BTreeMap::new(),
            burst_hz: RateConfig::default().burst_hz(),
            started: None,
            emitted: 0,
        }
    }

    /// Deterministic ramp, offset per scan position.
    fn scan(&self, index: u64) -> Vec<u8> {
        let count = self.channels.len().max(1);
        let values: Vec<u16> = (0..count)
            .map(|c| (6192 + ((index * 37 + c as u64 * 1000) % 4000)) as u16)
            .collect();
        encode_scan(&values)
    }

    fn generate(&mut self) -> Vec<u8> {
        let Some(started) = self.started else {
            return Vec::new();
        };
        let due = (started.elapsed().as_secs_f64() * self.burst_hz) as u64;
        let pending = due.saturating_sub(self.emitted).min(MAX_SCANS_PER_POLL);
        let mut bytes = Vec::new();
        for _ in 0..pending {
            bytes.extend(self.scan(self.emitted));
            self.emitted += 1;
        }
        bytes
    }
}

struct MockState {
    open: bool,
    echo: bool,
    streaming: bool,
    fail_writes: bool,
    fail_buffer_queries: bool,
    rx: VecDeque<u8>,
    written: Vec<u8>,
    pending: Vec<u8>,
    commands: Vec<Vec<u8>>,
    replies: HashMap<[u8; 2], Vec<u8>>,
    rejected: HashSet<Vec<u8>>,
    stream_on_start: Vec<u8>,
    simulator: Option<Simulator>,
}

impl MockState {
    fn new() -> Self {
        Self {
            open: true,
            echo: true,
            streaming: false,
            fail_writes: false,
            fail_buffer_queries: false,
            rx: VecDeque::new(),
            written: Vec::new(),
            pending: Vec::new(),
            commands: Vec::new(),
            replies: HashMap::new(),
            rejected: HashSet::new(),
            stream_on_start: Vec::new(),
            simulator: None,
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        if self.echo {
            self.rx.extend(bytes.iter().copied());
        }
    }

    /// Split the pending bytes into complete commands and act on them.
    fn process(&mut self) {
        loop {
            if self.pending.first() == Some(&0x00) {
                if self.pending.len() < 3 {
                    return;
                }
                let code = [self.pending[1], self.pending[2]];
                let frame: Vec<u8> = self.pending.drain(..3).collect();
                self.commands.push(frame);
                self.short_command(code);
            } else if let Some(end) = self.pending.iter().position(|&b| b == b'\r') {
                let frame: Vec<u8> = self.pending.drain(..=end).collect();
                self.commands.push(frame.clone());
                self.long_command(&frame);
            } else {
                return;
            }
        }
    }

    fn short_command(&mut self, code: [u8; 2]) {
        debug!("Mock DI-245 received {:?}", String::from_utf8_lossy(&code));
        self.respond(&code);
        match &code {
            b"S1" => {
                self.streaming = true;
                let preload = std::mem::take(&mut self.stream_on_start);
                self.rx.extend(preload);
                if let Some(sim) = self.simulator.as_mut() {
                    sim.started = Some(Instant::now());
                    sim.emitted = 0;
                }
            }
            b"S0" => {
                self.streaming = false;
                if let Some(sim) = self.simulator.as_mut() {
                    sim.started = None;
                }
            }
            _ => {
                if let Some(reply) = self.replies.get(&code).cloned() {
                    self.respond(&reply);
                }
            }
        }
    }

    fn long_command(&mut self, frame: &[u8]) {
        if self.rejected.contains(frame) {
            // Answer with a corrupted echo: last digit bumped
            let mut echoed = frame.to_vec();
            if let Some(b) = echoed.iter_mut().rev().find(|b| b.is_ascii_digit()) {
                *b = if *b == b'9' { b'0' } else { *b + 1 };
            }
            self.respond(&echoed);
            return;
        }
        self.respond(frame);

        let text = String::from_utf8_lossy(frame);
        let mut parts = text.split_whitespace();
        let (Some(sim), Some(name)) = (self.simulator.as_mut(), parts.next()) else {
            return;
        };
        let args: Vec<u32> = parts.filter_map(|p| p.parse().ok()).collect();
        match (name, args.as_slice()) {
            ("chn", [position, value]) => {
                sim.channels.insert(*position as u8, *value as u16);
            }
            ("xrate", [value, _burst]) => {
                sim.burst_hz = RateConfig::from_config_value(*value as u16).burst_hz();
            }
            _ => {}
        }
    }
}

/// Emulated DI-245 serial handle.
#[derive(Clone)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPort {
    /// An open port that echoes commands and has no scripted replies.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
        }
    }

    /// A port that also answers the four descriptor queries.
    pub fn di245() -> Self {
        let port = Self::new();
        port.set_reply(*b"A1", format!("{MOCK_DEVICE_NAME}\r").as_bytes());
        port.set_reply(*b"A2", format!("{MOCK_FIRMWARE}\r").as_bytes());
        port.set_reply(*b"A7", format!("{MOCK_CALIBRATION_DATE}\r").as_bytes());
        port.set_reply(*b"NZ", format!("{MOCK_SERIAL_NUMBER}\r").as_bytes());
        port
    }

    /// A [`di245`](Self::di245) port that produces a synthetic stream in real time.
    pub fn simulator() -> Self {
        let port = Self::di245();
        port.state.lock().simulator = Some(Simulator::new());
        port
    }

    /// Reply sent after the echo of short command `code`.
    pub fn set_reply(&self, code: [u8; 2], reply: &[u8]) {
        self.state.lock().replies.insert(code, reply.to_vec());
    }

    /// Bytes released into the receive buffer when `S1` arrives.
    pub fn preload_stream(&self, bytes: &[u8]) {
        self.state.lock().stream_on_start.extend_from_slice(bytes);
    }

    /// Push bytes into the receive buffer as if the device had sent them.
    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    /// Answer `frame` with a corrupted echo.
    pub fn reject(&self, frame: &[u8]) {
        self.state.lock().rejected.insert(frame.to_vec());
    }

    /// Enable or disable all device responses.
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Make writes fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make `bytes_to_read`/`bytes_to_write` fail while the port stays open.
    pub fn fail_buffer_queries(&self, fail: bool) {
        self.state.lock().fail_buffer_queries = fail;
    }

    /// Simulate the cable being pulled.
    pub fn disconnect(&self) {
        self.state.lock().open = false;
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Complete commands received so far, in order.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().commands.clone()
    }

    /// Whether the emulated device is scanning.
    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    /// Bytes waiting in the receive buffer.
    pub fn pending_input(&self) -> usize {
        self.state.lock().rx.len()
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "mock port disconnected")
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Self::closed());
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Self::closed());
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        state.written.extend_from_slice(buf);
        state.pending.extend_from_slice(buf);
        state.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PortIo for MockPort {
    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn bytes_to_read(&self) -> io::Result<u32> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.open {
            return Err(Self::closed());
        }
        if state.fail_buffer_queries {
            return Err(io::Error::new(io::ErrorKind::Other, "injected query failure"));
        }
        if state.streaming {
            if let Some(sim) = state.simulator.as_mut() {
                let bytes = sim.generate();
                state.rx.extend(bytes);
            }
        }
        Ok(state.rx.len() as u32)
    }

    fn bytes_to_write(&self) -> io::Result<u32> {
        let state = self.state.lock();
        if !state.open {
            return Err(Self::closed());
        }
        if state.fail_buffer_queries {
            return Err(io::Error::new(io::ErrorKind::Other, "injected query failure"));
        }
        Ok(0)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Self::closed());
        }
        state.rx.clear();
        Ok(())
    }

    fn clear_output(&mut self) -> io::Result<()> {
        if !self.state.lock().open {
            return Err(Self::closed());
        }
        Ok(())
    }
}
