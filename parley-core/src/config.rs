//! Fixed audio formats for both directions.
//!
//! The capture and playback rates are independent constants. They are not
//! negotiated with the remote end: the transport contract says capture frames
//! are 16 kHz and playback chunks arrive at the output rate already.

use serde::{Deserialize, Serialize};

pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// 4096 samples ≈ 256 ms at 16 kHz.
pub const DEFAULT_CAPTURE_BLOCK_SIZE: usize = 4_096;
pub const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Only mono is supported in either direction.
pub const CHANNELS: u16 = 1;

/// Configuration for `CaptureEncoder`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CaptureConfig {
    /// Rate of the frames handed to the transport (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Always 1.
    pub channels: u16,
    /// Samples per emitted frame. Default: 4096.
    pub block_size: usize,
    /// Input device name to prefer over the system default.
    pub preferred_input_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            channels: CHANNELS,
            block_size: DEFAULT_CAPTURE_BLOCK_SIZE,
            preferred_input_device: None,
        }
    }
}

impl CaptureConfig {
    pub fn normalize(&mut self) {
        if self.sample_rate == 0 {
            self.sample_rate = DEFAULT_CAPTURE_SAMPLE_RATE;
        }
        if self.block_size == 0 {
            self.block_size = DEFAULT_CAPTURE_BLOCK_SIZE;
        }
        self.channels = CHANNELS;
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    /// Duration of one frame in milliseconds.
    pub fn block_duration_ms(&self) -> f64 {
        self.block_size as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Configuration for `PlaybackEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PlaybackConfig {
    /// Rate the incoming chunks are assumed to be at (Hz). Default: 24000.
    pub sample_rate: u32,
    /// Always 1.
    pub channels: u16,
    /// Gain applied from `init()` until the first `set_volume`, in [0, 1].
    pub initial_volume: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_PLAYBACK_SAMPLE_RATE,
            channels: CHANNELS,
            initial_volume: 1.0,
        }
    }
}

impl PlaybackConfig {
    pub fn normalize(&mut self) {
        if self.sample_rate == 0 {
            self.sample_rate = DEFAULT_PLAYBACK_SAMPLE_RATE;
        }
        self.channels = CHANNELS;
        self.initial_volume = if self.initial_volume.is_finite() {
            self.initial_volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_contract() {
        let capture = CaptureConfig::default();
        assert_eq!(capture.sample_rate, 16_000);
        assert_eq!(capture.block_size, 4_096);
        assert!((capture.block_duration_ms() - 256.0).abs() < 1e-9);

        let playback = PlaybackConfig::default();
        assert_eq!(playback.sample_rate, 24_000);
        assert_eq!(playback.channels, 1);
    }

    #[test]
    fn normalize_restores_invalid_values() {
        let mut capture = CaptureConfig {
            sample_rate: 0,
            channels: 2,
            block_size: 0,
            preferred_input_device: Some("   ".into()),
        };
        capture.normalize();
        assert_eq!(capture, CaptureConfig::default());

        let mut playback = PlaybackConfig {
            sample_rate: 0,
            channels: 2,
            initial_volume: 3.0,
        };
        playback.normalize();
        assert_eq!(playback.sample_rate, 24_000);
        assert_eq!(playback.channels, 1);
        assert_eq!(playback.initial_volume, 1.0);

        playback.initial_volume = f32::NAN;
        playback.normalize();
        assert_eq!(playback.initial_volume, 1.0);
    }

    #[test]
    fn deserializes_partial_camel_case_json() {
        let cfg: CaptureConfig =
            serde_json::from_str(r#"{"blockSize": 2048}"#).expect("parse capture config");
        assert_eq!(cfg.block_size, 2048);
        assert_eq!(cfg.sample_rate, 16_000);
    }
}
