//! Data carried on each side of the transport.

use std::sync::Arc;

use crate::codec;

/// One fixed-length block of mono capture audio, already serialised.
///
/// Created once per processing tick and handed straight to the transport
/// callback; nothing keeps it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Base64 of little-endian PCM16 samples.
    pub base64: String,
    /// Number of samples encoded (equals the configured block size).
    pub samples: usize,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Zero-based index of this frame since capture started.
    pub index: u64,
}

impl AudioFrame {
    /// Encode a block of float samples.
    pub fn encode(block: &[f32], sample_rate: u32, index: u64) -> Self {
        Self {
            base64: codec::encode_base64(block),
            samples: block.len(),
            sample_rate,
            index,
        }
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples as f64 / self.sample_rate as f64
    }
}

/// A decoded playback chunk: mono f32 samples in [-1.0, 1.0] at the output rate.
///
/// Samples sit behind an `Arc` so binding a buffer to a playback node never
/// copies audio.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Decode one base64 chunk, assuming it is already at `sample_rate`.
    pub fn from_base64(chunk: &str, sample_rate: u32) -> crate::error::Result<Self> {
        Ok(Self::new(codec::decode_base64(chunk)?, sample_rate))
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the sample data.
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the buffer contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the duration of this buffer in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_reports_duration_and_length() {
        let frame = AudioFrame::encode(&vec![0.0; 4096], 16_000, 3);
        assert_eq!(frame.samples, 4096);
        assert_eq!(frame.index, 3);
        assert!((frame.duration_secs() - 0.256).abs() < 1e-9);
        // 4096 samples * 2 bytes = 8192 bytes → 10924 base64 chars (padded).
        assert_eq!(frame.base64.len(), 10_924);
    }

    #[test]
    fn decoded_buffer_shares_samples() {
        let buf = DecodedBuffer::new(vec![0.25; 240], 24_000);
        let shared = buf.shared_samples();
        assert_eq!(shared.len(), 240);
        assert!((buf.duration_secs() - 0.01).abs() < 1e-9);
        assert!(!buf.is_empty());
    }
}
