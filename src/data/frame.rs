//! One scan worth of channel readings.

/// Mid-scale count of the 14-bit converter.
pub const MID_SCALE: i16 = 8192;

/// Largest count the converter produces.
pub const MAX_COUNT: u16 = 0x3FFF;

/// Readings of one scan cycle, ordered by scan position.
///
/// Each value is a raw unsigned 14-bit count in `[0, 16383]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleFrame {
    values: Vec<u16>,
}

impl SampleFrame {
    /// Wrap raw counts.
    pub fn new(values: Vec<u16>) -> Self {
        Self { values }
    }

    /// A frame of `channel_count` zero counts.
    pub fn zeroed(channel_count: usize) -> Self {
        Self {
            values: vec![0; channel_count],
        }
    }

    /// Raw counts in scan order.
    pub fn values(&self) -> &[u16] {
        &self.values
    }

    /// Consume into the raw counts.
    pub fn into_values(self) -> Vec<u16> {
        self.values
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the frame holds no channels.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Signed readings around mid scale (`count - 8192`), in `[-8192, 8191]`.
    pub fn centered(&self) -> Vec<i16> {
        self.values
            .iter()
            .map(|&v| (v & MAX_COUNT) as i16 - MID_SCALE)
            .collect()
    }
}

impl From<Vec<u16>> for SampleFrame {
    fn from(values: Vec<u16>) -> Self {
        Self::new(values)
    }
}
