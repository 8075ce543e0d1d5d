//! Linear PCM16 <-> f32 conversion and base64 framing.
//!
//! ## Wire format
//!
//! One chunk = base64 (standard alphabet, padded) of raw little-endian signed
//! 16-bit mono samples. No header; the sample rate is a configured constant on
//! each side.
//!
//! ## Scaling
//!
//! Encoding is asymmetric: negative samples scale by 32768, positive ones by
//! 32767, so both -1.0 and 1.0 land exactly on the int16 extremes. Decoding
//! always divides by 32768.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{ParleyError, Result};

/// Bytes per encoded sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Convert one float sample to int16, clamping to [-1, 1] first.
///
/// Rounds to the nearest step. A round trip through [`pcm16_to_f32`] is off
/// by at most 0.5/32768 for negative samples and 1.5/32768 for positive ones
/// (the extra step is the 32767/32768 scale mismatch).
#[inline]
pub fn f32_to_pcm16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence.
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Convert one int16 sample to a float in [-1.0, 1.0).
#[inline]
pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Serialise float samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &s in samples {
        bytes.extend_from_slice(&f32_to_pcm16(s).to_le_bytes());
    }
    bytes
}

/// Interpret little-endian PCM16 bytes as normalised float samples.
///
/// # Errors
/// `ParleyError::Decode` when the length is not a multiple of 2.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(ParleyError::Decode(format!(
            "byte length {} is not a multiple of {BYTES_PER_SAMPLE}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect())
}

/// Encode a block of float samples into a transport-ready base64 string.
pub fn encode_base64(samples: &[f32]) -> String {
    STANDARD.encode(encode_pcm16(samples))
}

/// Decode a base64 PCM16 chunk into float samples.
///
/// Leading and trailing whitespace is ignored.
///
/// # Errors
/// `ParleyError::Decode` on malformed base64 or an odd byte count.
pub fn decode_base64(chunk: &str) -> Result<Vec<f32>> {
    let bytes = STANDARD
        .decode(chunk.trim())
        .map_err(|e| ParleyError::Decode(format!("invalid base64: {e}")))?;
    decode_pcm16(&bytes)
}
