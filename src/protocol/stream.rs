//! Binary scan stream: bit synchronization and sample decoding.
//!
//! After `S1` the DI-245 sends one little-endian 16-bit word per enabled channel per scan,
//! channels in scan order, forever. Two bits of every word are framing rather than data.
//! Counting positions MSB-first in the 16-character rendering used by the device notes:
//!
//! | position | numeric bit | meaning |
//! |---|---|---|
//! | 15 | 0 (low bit of first byte) | sync: 0 on the first word of a scan, 1 otherwise |
//! | 7 | 8 (low bit of second byte) | marker: always 1 |
//!
//! The remaining 14 bits, taken MSB-first, form the reading `[0, 16383]`. The marker is
//! dropped without being checked; only the sync bit carries framing information.
//!
//! Synchronization looks for a whole scan whose sync bits read `0, 1, 1, ...` and steps one
//! word at a time. After a long run of failed candidates the window moves by a single byte
//! instead, which recovers from a dropped byte. With a single channel the pattern has no
//! redundancy: a stream shifted by one byte whose marker bits are clear cannot be told apart
//! from an aligned one.

use std::time::Duration;
use tracing::{debug, warn};

use crate::data::SampleFrame;
use crate::error::{AppResult, DaqError};
use crate::hardware::port::PortIo;
use crate::hardware::transport::{Reply, SerialTransport};

/// Numeric mask of the sync bit (position 15).
pub const SYNC_BIT: u16 = 0x0001;

/// Numeric mask of the reserved marker bit (position 7).
pub const MARKER_BIT: u16 = 0x0100;

/// Default limit on bytes discarded while looking for a scan boundary.
pub const DEFAULT_MAX_DISCARD: usize = 4096;

/// Consecutive failed word-aligned candidates before the search moves by a single byte.
///
/// An aligned stream fits within one scan's worth of candidates, so a long run of failures
/// means the reader is off by one byte or still inside garbage.
const PHASE_SHIFT_AFTER: usize = 64;

/// Extract the 14-bit reading from a raw word.
pub fn decode_word(word: u16) -> u16 {
    (((word >> 9) & 0x7F) << 7) | ((word >> 1) & 0x7F)
}

/// Build the raw word for `value` (masked to 14 bits).
///
/// The sync bit is cleared for the first word of a scan and set otherwise; the marker is
/// always set.
pub fn encode_word(value: u16, first_of_scan: bool) -> u16 {
    let high = (value >> 7) & 0x7F;
    let low = value & 0x7F;
    let sync = if first_of_scan { 0 } else { SYNC_BIT };
    (high << 9) | MARKER_BIT | (low << 1) | sync
}

/// Encode one scan of readings into wire bytes.
pub fn encode_scan(values: &[u16]) -> Vec<u8> {
    values
        .iter()
        .enumerate()
        .flat_map(|(i, &v)| encode_word(v, i == 0).to_le_bytes())
        .collect()
}

/// Whether `word` is the first word of a scan cycle.
pub fn is_scan_start(word: u16) -> bool {
    word & SYNC_BIT == 0
}

fn word_fits_position(word: u16, first_of_scan: bool) -> bool {
    is_scan_start(word) == first_of_scan
}

/// Whether `bytes` holds exactly one scan with the sync bits in place.
fn is_aligned_scan(bytes: &[u8]) -> bool {
    bytes
        .chunks_exact(2)
        .enumerate()
        .all(|(i, pair)| word_fits_position(u16::from_le_bytes([pair[0], pair[1]]), i == 0))
}

/// Result of a successful synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Bytes dropped before the scan start was found.
    pub discarded: usize,
    /// The first aligned scan, already read from the port but not yet decoded.
    pub boundary_scan: Vec<u8>,
}

/// Aligns a running stream on a scan boundary.
#[derive(Debug, Clone)]
pub struct StreamSynchronizer {
    channel_count: usize,
    max_discard: usize,
    timeout: Duration,
}

impl StreamSynchronizer {
    /// Synchronizer for scans of `channel_count` words.
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count,
            max_discard: DEFAULT_MAX_DISCARD,
            timeout: Duration::from_secs(1),
        }
    }

    /// Give up with [`DaqError::SyncLost`] after this many discarded bytes.
    pub fn with_max_discard(mut self, max_discard: usize) -> Self {
        self.max_discard = max_discard;
        self
    }

    /// Give up with [`DaqError::SyncTimeout`] when a single read waits longer than this.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn read_bytes<P: PortIo>(
        &self,
        transport: &mut SerialTransport<P>,
        count: usize,
    ) -> AppResult<Vec<u8>> {
        match transport.read(Some(count), self.timeout)? {
            Reply::Data(bytes) => Ok(bytes),
            Reply::TimedOut | Reply::NotSent => Err(DaqError::SyncTimeout),
        }
    }

    /// Consume bytes up to and including the first aligned scan.
    ///
    /// The scan itself is returned in [`SyncReport::boundary_scan`] so callers can decode
    /// it; the next read from the transport continues with the scan after it.
    pub fn synchronize<P: PortIo>(
        &self,
        transport: &mut SerialTransport<P>,
    ) -> AppResult<SyncReport> {
        let channels = self.channel_count.max(1);
        let shift_after = PHASE_SHIFT_AFTER.max(4 * channels);
        let mut window = self.read_bytes(transport, channels * 2)?;
        let mut discarded = 0usize;
        let mut failed = 0usize;

        while !is_aligned_scan(&window) {
            failed += 1;
            let step = if failed >= shift_after {
                failed = 0;
                1
            } else {
                2
            };
            if discarded + step > self.max_discard {
                warn!(discarded, "Scan boundary not found");
                return Err(DaqError::SyncLost { discarded });
            }
            window.drain(..step);
            window.extend(self.read_bytes(transport, step)?);
            discarded += step;
        }

        debug!(discarded, "Stream synchronized");
        Ok(SyncReport {
            discarded,
            boundary_scan: window,
        })
    }
}

/// Frames decoded from one block, plus what went wrong along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBlock {
    /// One frame per scan.
    pub frames: Vec<SampleFrame>,
    /// Words that were missing and zero-filled.
    pub decode_errors: usize,
    /// Words whose sync or marker bit disagreed with their position in the scan.
    pub misaligned_words: usize,
    /// The block did not arrive in time; `frames` is empty.
    pub timed_out: bool,
}

impl DecodedBlock {
    fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    /// Whether the block suggests the stream lost alignment.
    pub fn needs_resync(&self) -> bool {
        self.misaligned_words > 0
    }
}

/// Turns synchronized stream bytes into [`SampleFrame`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleDecoder {
    channel_count: usize,
}

impl SampleDecoder {
    /// Decoder for scans of `channel_count` words.
    pub fn new(channel_count: usize) -> AppResult<Self> {
        if channel_count == 0 {
            return Err(DaqError::InvalidScanList(
                "at least one channel is required".to_string(),
            ));
        }
        Ok(Self { channel_count })
    }

    /// Channels per scan.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Bytes making up `point_count` scans.
    pub fn block_len(&self, point_count: usize) -> usize {
        point_count * self.channel_count * 2
    }

    /// Decode `point_count` scans from `bytes`.
    ///
    /// Missing words are zero-filled so every scan still yields a frame.
    pub fn decode_block(&self, bytes: &[u8], point_count: usize) -> DecodedBlock {
        let mut block = DecodedBlock {
            frames: Vec::with_capacity(point_count),
            ..DecodedBlock::default()
        };

        for scan in 0..point_count {
            let mut values = Vec::with_capacity(self.channel_count);
            for channel in 0..self.channel_count {
                let offset = (scan * self.channel_count + channel) * 2;
                match bytes.get(offset..offset + 2) {
                    Some(&[lo, hi]) => {
                        let word = u16::from_le_bytes([lo, hi]);
                        if !word_fits_position(word, channel == 0) {
                            block.misaligned_words += 1;
                        }
                        values.push(decode_word(word));
                    }
                    _ => {
                        block.decode_errors += 1;
                        values.push(0);
                    }
                }
            }
            block.frames.push(SampleFrame::new(values));
        }

        if block.decode_errors > 0 {
            warn!(
                missing = block.decode_errors,
                received = bytes.len(),
                expected = self.block_len(point_count),
                "Incomplete block, missing words zero-filled"
            );
        }
        if block.misaligned_words > 0 {
            debug!(misaligned = block.misaligned_words, "Block framing bits out of place");
        }
        block
    }

    /// Read and decode `point_count` scans from the transport.
    pub fn decode<P: PortIo>(
        &self,
        transport: &mut SerialTransport<P>,
        point_count: usize,
        timeout: Duration,
    ) -> AppResult<DecodedBlock> {
        self.decode_after(transport, &[], point_count, timeout)
    }

    /// Like [`decode`](Self::decode), with `prefix` standing in for the first bytes of the
    /// block (typically [`SyncReport::boundary_scan`]). Only the remainder is read.
    pub fn decode_after<P: PortIo>(
        &self,
        transport: &mut SerialTransport<P>,
        prefix: &[u8],
        point_count: usize,
        timeout: Duration,
    ) -> AppResult<DecodedBlock> {
        let wanted = self.block_len(point_count).saturating_sub(prefix.len());
        match transport.read(Some(wanted), timeout)? {
            Reply::Data(rest) => {
                let mut bytes = Vec::with_capacity(prefix.len() + rest.len());
                bytes.extend_from_slice(prefix);
                bytes.extend(rest);
                Ok(self.decode_block(&bytes, point_count))
            }
            Reply::TimedOut | Reply::NotSent => Ok(DecodedBlock::timed_out()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPort;
    use tracing_test::traced_test;

    fn transport(port: &MockPort) -> SerialTransport<MockPort> {
        SerialTransport::new(port.clone()).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_decode_strips_framing_bits() {
        assert_eq!(decode_word(0xFFFF), 0x3FFF);
        assert_eq!(decode_word(SYNC_BIT | MARKER_BIT), 0);
        // Bits 9..=15 are the high seven bits of the reading
        assert_eq!(decode_word(0x7F << 9), 0x3F80);
        // Bits 1..=7 are the low seven bits
        assert_eq!(decode_word(0x7F << 1), 0x007F);
    }

    #[test]
    fn test_word_round_trip() {
        for value in [0u16, 1, 127, 128, 8192, 12345, 16383] {
            for first in [true, false] {
                let word = encode_word(value, first);
                assert_eq!(decode_word(word), value);
                assert_eq!(is_scan_start(word), first);
                assert_ne!(word & MARKER_BIT, 0);
            }
        }
        // Values wider than 14 bits are truncated
        assert_eq!(decode_word(encode_word(0xFFFF, true)), 0x3FFF);
    }

    #[test]
    fn test_decode_block_two_channels() {
        let decoder = SampleDecoder::new(2).unwrap();
        let mut bytes = encode_scan(&[100, 200]);
        bytes.extend(encode_scan(&[16383, 0]));

        let block = decoder.decode_block(&bytes, 2);
        assert_eq!(block.frames.len(), 2);
        assert_eq!(block.frames[0].values(), &[100, 200]);
        assert_eq!(block.frames[1].values(), &[16383, 0]);
        assert_eq!(block.decode_errors, 0);
        assert!(!block.needs_resync());
    }

    #[test]
    fn test_decode_block_detects_misalignment() {
        let decoder = SampleDecoder::new(2).unwrap();
        let bytes = encode_scan(&[1, 2]);
        // Shift by one word: channel order is swapped relative to the sync bit
        let mut shifted = bytes[2..].to_vec();
        shifted.extend(encode_scan(&[3, 4])[..2].iter());

        let block = decoder.decode_block(&shifted, 1);
        assert_eq!(block.misaligned_words, 2);
        assert!(block.needs_resync());
    }

    #[traced_test]
    #[test]
    fn test_decode_block_zero_fills_truncated_input() {
        let decoder = SampleDecoder::new(3).unwrap();
        let mut bytes = encode_scan(&[10, 20, 30]);
        bytes.truncate(3);

        let block = decoder.decode_block(&bytes, 1);
        assert_eq!(block.frames, vec![SampleFrame::new(vec![10, 0, 0])]);
        assert_eq!(block.decode_errors, 2);
        assert!(logs_contain("zero-filled"));
    }

    #[test]
    fn test_decoder_requires_channels() {
        assert!(SampleDecoder::new(0).is_err());
    }

    /// Device word with the marker bit clear, the way a bare inverse encoding builds it.
    fn word_without_marker(value: u16, first_of_scan: bool) -> u16 {
        let sync = if first_of_scan { 0 } else { SYNC_BIT };
        (((value >> 7) & 0x7F) << 9) | ((value & 0x7F) << 1) | sync
    }

    fn scan_without_marker(values: &[u16]) -> Vec<u8> {
        values
            .iter()
            .enumerate()
            .flat_map(|(i, &v)| word_without_marker(v, i == 0).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_round_trip_with_marker_clear() {
        for value in [0u16, 1, 127, 128, 4000, 8192, 12345, 16383] {
            for first in [true, false] {
                let word = word_without_marker(value, first);
                assert_eq!(word & MARKER_BIT, 0);
                assert_eq!(decode_word(word), value);
                assert_eq!(is_scan_start(word), first);
            }
        }
    }

    #[test]
    fn test_decode_block_ignores_marker_bit() {
        let decoder = SampleDecoder::new(2).unwrap();
        let mut bytes = scan_without_marker(&[8192, 100]);
        bytes.extend(encode_scan(&[16383, 4000]));

        let block = decoder.decode_block(&bytes, 2);
        assert_eq!(block.misaligned_words, 0);
        assert_eq!(block.frames[0].values(), &[8192, 100]);
        assert_eq!(block.frames[1].values(), &[16383, 4000]);
    }

    #[test]
    fn test_synchronize_keeps_boundary_scan() {
        let port = MockPort::new();
        port.feed(&encode_scan(&[1, 2, 3]));
        port.feed(&encode_scan(&[4, 5, 6]));
        let mut t = transport(&port);

        let report = StreamSynchronizer::new(3)
            .with_timeout(Duration::from_millis(50))
            .synchronize(&mut t)
            .unwrap();
        assert_eq!(report.discarded, 0);
        assert_eq!(report.boundary_scan, encode_scan(&[1, 2, 3]));

        let decoder = SampleDecoder::new(3).unwrap();
        let block = decoder
            .decode_after(&mut t, &report.boundary_scan, 2, Duration::from_millis(50))
            .unwrap();
        assert_eq!(block.frames[0].values(), &[1, 2, 3]);
        assert_eq!(block.frames[1].values(), &[4, 5, 6]);
    }

    #[test]
    fn test_synchronize_after_garbage_words_with_marker_clear() {
        for garbage_words in 0..6u16 {
            let port = MockPort::new();
            for g in 0..garbage_words {
                port.feed(&word_without_marker(300 + g, false).to_le_bytes());
            }
            port.feed(&scan_without_marker(&[100, 200]));
            port.feed(&scan_without_marker(&[300, 400]));
            let mut t = transport(&port);

            let report = StreamSynchronizer::new(2)
                .with_timeout(Duration::from_millis(50))
                .synchronize(&mut t)
                .unwrap();
            assert_eq!(report.discarded, usize::from(garbage_words) * 2);
            assert_eq!(report.boundary_scan, scan_without_marker(&[100, 200]));

            let block = SampleDecoder::new(2)
                .unwrap()
                .decode(&mut t, 1, Duration::from_millis(50))
                .unwrap();
            assert_eq!(block.frames[0].values(), &[300, 400]);
        }
    }

    #[test]
    fn test_synchronize_mid_scan() {
        // Joining the stream halfway through a scan, on a word boundary
        let port = MockPort::new();
        let first = encode_scan(&[7, 8, 9, 10]);
        port.feed(&first[4..]);
        port.feed(&encode_scan(&[11, 12, 13, 14]));
        port.feed(&encode_scan(&[15, 16, 17, 18]));
        let mut t = transport(&port);

        let report = StreamSynchronizer::new(4)
            .with_timeout(Duration::from_millis(50))
            .synchronize(&mut t)
            .unwrap();
        assert_eq!(report.discarded, 4);
        assert_eq!(report.boundary_scan, encode_scan(&[11, 12, 13, 14]));
        let block = SampleDecoder::new(4)
            .unwrap()
            .decode(&mut t, 1, Duration::from_millis(50))
            .unwrap();
        assert_eq!(block.frames[0].values(), &[15, 16, 17, 18]);
    }

    #[test]
    fn test_synchronize_recovers_from_odd_byte_offset() {
        for stray in 1..4usize {
            let port = MockPort::new();
            port.feed(&vec![0xFF; stray * 2 - 1]);
            for i in 0..200u16 {
                port.feed(&encode_scan(&[i, 1000 + i]));
            }
            let mut t = transport(&port);

            let report = StreamSynchronizer::new(2)
                .with_timeout(Duration::from_millis(50))
                .synchronize(&mut t)
                .unwrap();
            let decoder = SampleDecoder::new(2).unwrap();
            let block = decoder
                .decode_after(&mut t, &report.boundary_scan, 3, Duration::from_millis(50))
                .unwrap();
            assert!(!block.needs_resync());
            let first = block.frames[0].values()[0];
            for (k, frame) in block.frames.iter().enumerate() {
                let i = first + k as u16;
                assert_eq!(frame.values(), &[i, 1000 + i]);
            }
        }
    }

    #[test]
    fn test_synchronize_silent_stream() {
        let port = MockPort::new();
        let mut t = transport(&port);
        let result = StreamSynchronizer::new(2)
            .with_timeout(Duration::from_millis(10))
            .synchronize(&mut t);
        assert!(matches!(result, Err(DaqError::SyncTimeout)));
    }

    #[test]
    fn test_synchronize_gives_up() {
        let port = MockPort::new();
        port.feed(&[0xFF; 64]);
        let mut t = transport(&port);
        let result = StreamSynchronizer::new(2)
            .with_max_discard(16)
            .with_timeout(Duration::from_millis(10))
            .synchronize(&mut t);
        assert!(matches!(result, Err(DaqError::SyncLost { discarded: 16 })));
    }

    #[test]
    fn test_decode_timeout() {
        let port = MockPort::new();
        port.feed(&encode_scan(&[1, 2]));
        let mut t = transport(&port);
        let block = SampleDecoder::new(2)
            .unwrap()
            .decode(&mut t, 2, Duration::from_millis(10))
            .unwrap();
        assert!(block.timed_out);
        assert!(block.frames.is_empty());
    }
}
