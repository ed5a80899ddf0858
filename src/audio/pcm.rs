//! s16le to float sample conversion

/// Scale of a signed 16-bit sample
const I16_SCALE: f32 = 32768.0;

/// Normalize one signed 16-bit sample into [-1.0, 1.0)
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / I16_SCALE
}

/// Converts arbitrarily split s16le byte chunks into normalized floats.
///
/// A trailing odd byte is carried into the next chunk so sample
/// alignment survives any transport chunking.
#[derive(Default)]
pub struct PcmConverter {
    carry: Option<u8>,
    /// Output buffer (reused to avoid allocations)
    samples: Vec<f32>,
}

impl PcmConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a chunk, returning the samples completed by it
    pub fn convert(&mut self, bytes: &[u8]) -> &[f32] {
        self.samples.clear();
        let mut bytes = bytes;

        if let Some(low) = self.carry.take() {
            match bytes.split_first() {
                Some((&high, rest)) => {
                    self.samples.push(i16_to_f32(i16::from_le_bytes([low, high])));
                    bytes = rest;
                }
                None => {
                    self.carry = Some(low);
                    return &self.samples;
                }
            }
        }

        let mut pairs = bytes.chunks_exact(2);
        self.samples.extend(
            pairs
                .by_ref()
                .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]]))),
        );
        self.carry = pairs.remainder().first().copied();

        &self.samples
    }

    /// Whether half a sample is waiting for its second byte
    pub fn has_partial_sample(&self) -> bool {
        self.carry.is_some()
    }

    /// Drop any carried byte (new stream)
    pub fn reset(&mut self) {
        self.carry = None;
        self.samples.clear();
    }
}
