//! Fixed-capacity ring buffer of decoded frames.
//!
//! Samples are stored flat (`capacity * channel_count` counts) so an append is a single
//! `copy_from_slice` and the buffer never allocates after construction. Once full, each
//! append overwrites the oldest frame.
//!
//! # Concurrency
//! One writer (the acquisition loop) and any number of readers share the buffer through an
//! `Arc`. A `parking_lot::Mutex` guards the slots and is only held while copying frames in
//! or out.
//!
//! # Memory Layout
//! ```text
//! samples: [f0c0 f0c1 .. f0cN | f1c0 f1c1 .. f1cN | ... ]   (capacity frames)
//!           ^ slot 0            ^ slot 1
//! write_cursor: next slot to write
//! stored:       min(total_appended, capacity)
//! ```

use parking_lot::Mutex;

use crate::data::SampleFrame;
use crate::error::{AppResult, DaqError};

struct Slots {
    samples: Vec<u16>,
    write_cursor: usize,
    stored: usize,
    total_appended: u64,
}

/// Bounded FIFO-eviction store of [`SampleFrame`]s.
pub struct RingBuffer {
    capacity: usize,
    channel_count: usize,
    slots: Mutex<Slots>,
}

impl RingBuffer {
    /// Allocate room for `capacity` frames of `channel_count` channels.
    ///
    /// # Example
    /// ```
    /// use di245_daq::data::{RingBuffer, SampleFrame};
    ///
    /// let rb = RingBuffer::new(2, 1).unwrap();
    /// for v in 1..=3 {
    ///     rb.append(&SampleFrame::new(vec![v])).unwrap();
    /// }
    /// let newest: Vec<u16> = rb.drain_all().iter().map(|f| f.values()[0]).collect();
    /// assert_eq!(newest, vec![2, 3]);
    /// ```
    pub fn new(capacity: usize, channel_count: usize) -> AppResult<Self> {
        if capacity == 0 {
            return Err(DaqError::Configuration(
                "ring buffer capacity must be at least one frame".to_string(),
            ));
        }
        if channel_count == 0 {
            return Err(DaqError::Configuration(
                "ring buffer needs at least one channel".to_string(),
            ));
        }
        let len = capacity.checked_mul(channel_count).ok_or_else(|| {
            DaqError::Configuration(format!(
                "ring buffer of {capacity} x {channel_count} samples is too large"
            ))
        })?;

        Ok(Self {
            capacity,
            channel_count,
            slots: Mutex::new(Slots {
                samples: vec![0; len],
                write_cursor: 0,
                stored: 0,
                total_appended: 0,
            }),
        })
    }

    fn check_width(&self, frame: &SampleFrame) -> AppResult<()> {
        if frame.len() == self.channel_count {
            Ok(())
        } else {
            Err(DaqError::FrameWidthMismatch {
                expected: self.channel_count,
                got: frame.len(),
            })
        }
    }

    fn write_slot(&self, slots: &mut Slots, frame: &SampleFrame) {
        let start = slots.write_cursor * self.channel_count;
        slots.samples[start..start + self.channel_count].copy_from_slice(frame.values());
        slots.write_cursor = (slots.write_cursor + 1) % self.capacity;
        slots.stored = (slots.stored + 1).min(self.capacity);
        slots.total_appended += 1;
    }

    /// Append one frame, evicting the oldest when full.
    pub fn append(&self, frame: &SampleFrame) -> AppResult<()> {
        self.check_width(frame)?;
        let mut slots = self.slots.lock();
        self.write_slot(&mut slots, frame);
        Ok(())
    }

    /// Append frames in order under one lock acquisition.
    ///
    /// Width is checked for every frame before anything is written, so a rejected block
    /// leaves the buffer untouched.
    pub fn append_block(&self, frames: &[SampleFrame]) -> AppResult<()> {
        for frame in frames {
            self.check_width(frame)?;
        }
        let mut slots = self.slots.lock();
        for frame in frames {
            self.write_slot(&mut slots, frame);
        }
        Ok(())
    }

    /// The `n` most recent frames, oldest first.
    pub fn snapshot(&self, n: usize) -> Vec<SampleFrame> {
        let slots = self.slots.lock();
        let count = n.min(slots.stored);
        // Oldest requested slot, counting back from the cursor
        let first = (slots.write_cursor + self.capacity - count) % self.capacity;

        (0..count)
            .map(|i| {
                let start = ((first + i) % self.capacity) * self.channel_count;
                SampleFrame::new(slots.samples[start..start + self.channel_count].to_vec())
            })
            .collect()
    }

    /// Every stored frame, oldest first. The buffer is left as is.
    pub fn drain_all(&self) -> Vec<SampleFrame> {
        self.snapshot(self.capacity)
    }

    /// The most recent frame.
    pub fn latest(&self) -> Option<SampleFrame> {
        self.snapshot(1).pop()
    }

    /// Frames currently stored.
    pub fn len(&self) -> usize {
        self.slots.lock().stored
    }

    /// Whether nothing has been appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of frames held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Channels per frame.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Frames appended since construction, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.slots.lock().total_appended
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("channel_count", &self.channel_count)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn frame(values: &[u16]) -> SampleFrame {
        SampleFrame::new(values.to_vec())
    }

    #[test]
    fn test_create_ring_buffer() {
        let rb = RingBuffer::new(8, 4).unwrap();
        assert_eq!(rb.capacity(), 8);
        assert_eq!(rb.channel_count(), 4);
        assert!(rb.is_empty());
        assert!(rb.snapshot(3).is_empty());
        assert!(rb.latest().is_none());

        assert!(RingBuffer::new(0, 4).is_err());
        assert!(RingBuffer::new(4, 0).is_err());
    }

    #[test]
    fn test_append_and_snapshot() {
        let rb = RingBuffer::new(4, 2).unwrap();
        rb.append(&frame(&[1, 10])).unwrap();
        rb.append(&frame(&[2, 20])).unwrap();
        rb.append(&frame(&[3, 30])).unwrap();

        assert_eq!(rb.len(), 3);
        assert_eq!(rb.snapshot(2), vec![frame(&[2, 20]), frame(&[3, 30])]);
        // Asking for more than stored returns what exists
        assert_eq!(rb.snapshot(10).len(), 3);
        assert_eq!(rb.latest(), Some(frame(&[3, 30])));
    }

    #[test]
    fn test_circular_wrap() {
        let capacity = 5;
        let rb = RingBuffer::new(capacity, 1).unwrap();

        // capacity + k appends keep exactly the newest `capacity` frames
        for k in 0..3u16 {
            let rb_total = capacity as u16 + k;
            let rb = RingBuffer::new(capacity, 1).unwrap();
            for v in 0..rb_total {
                rb.append(&frame(&[v])).unwrap();
            }
            let kept: Vec<u16> = rb.drain_all().iter().map(|f| f.values()[0]).collect();
            let expected: Vec<u16> = (k..rb_total).collect();
            assert_eq!(kept, expected);
            assert_eq!(rb.len(), capacity);
            assert_eq!(rb.total_appended(), u64::from(rb_total));
        }

        // Draining does not consume
        rb.append(&frame(&[7])).unwrap();
        assert_eq!(rb.drain_all(), rb.drain_all());
    }

    #[test]
    fn test_append_block() {
        let rb = RingBuffer::new(3, 2).unwrap();
        let frames: Vec<_> = (0..4u16).map(|v| frame(&[v, v + 100])).collect();
        rb.append_block(&frames).unwrap();
        assert_eq!(rb.drain_all(), frames[1..].to_vec());
    }

    #[test]
    fn test_frame_width_mismatch() {
        let rb = RingBuffer::new(3, 2).unwrap();
        assert!(matches!(
            rb.append(&frame(&[1, 2, 3])),
            Err(DaqError::FrameWidthMismatch {
                expected: 2,
                got: 3
            })
        ));

        // A bad frame anywhere in a block rejects the whole block
        let block = vec![frame(&[1, 2]), frame(&[3])];
        assert!(rb.append_block(&block).is_err());
        assert!(rb.is_empty());
    }

    #[test]
    fn test_concurrent_write_read() {
        let rb = Arc::new(RingBuffer::new(100, 2).unwrap());

        let rb_writer = Arc::clone(&rb);
        let writer = thread::spawn(move || {
            for i in 0..1000u16 {
                rb_writer.append(&frame(&[i, i])).unwrap();
            }
        });

        let rb_reader = Arc::clone(&rb);
        let reader = thread::spawn(move || {
            for _ in 0..100 {
                let frames = rb_reader.snapshot(50);
                // Readers never observe a torn frame or out-of-order frames
                for pair in frames.windows(2) {
                    assert_eq!(pair[0].values()[0], pair[0].values()[1]);
                    assert!(pair[0].values()[0] < pair[1].values()[0]);
                }
            }
        });

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(rb.len(), 100);
        assert_eq!(rb.latest(), Some(frame(&[999, 999])));
    }
}
