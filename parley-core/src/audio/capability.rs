//! Host audio capability detection with an explicit process-wide cache.
//!
//! `detect()` probes the host every time it is called. `capabilities()`
//! memoises the result; `invalidate()` drops it so the next call probes
//! again. Callers invalidate on device-change events; the playback engine
//! also invalidates when opening its sink fails.

use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the output side can render a mono stream at the playback rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// Device accepts one channel at the playback rate.
    Mono,
    /// Device needs two channels; the mono signal is duplicated.
    Stereo,
}

/// Result of probing the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub has_input: bool,
    pub has_output: bool,
    /// Output supports one channel at the probed rate.
    pub output_mono_at_rate: bool,
    /// Output supports two channels at the probed rate.
    pub output_stereo_at_rate: bool,
    /// The rate the output was probed at (Hz).
    pub probed_output_rate: u32,
}

impl DeviceCapabilities {
    /// Simplest layout the output supports, or `None` when the output cannot
    /// render the probed rate at all.
    pub fn negotiate_output(&self) -> Option<OutputLayout> {
        if !self.has_output {
            None
        } else if self.output_mono_at_rate {
            Some(OutputLayout::Mono)
        } else if self.output_stereo_at_rate {
            Some(OutputLayout::Stereo)
        } else {
            None
        }
    }
}

/// Probe the default host. Never cached.
#[cfg(feature = "audio-cpal")]
pub fn detect(output_rate: u32) -> DeviceCapabilities {
    use cpal::traits::{DeviceTrait, HostTrait};
    use cpal::SampleRate;

    let host = cpal::default_host();
    let has_input = host.default_input_device().is_some();
    let output = host.default_output_device();

    let mut caps = DeviceCapabilities {
        has_input,
        has_output: output.is_some(),
        probed_output_rate: output_rate,
        ..Default::default()
    };

    if let Some(device) = output {
        match device.supported_output_configs() {
            Ok(configs) => {
                for range in configs {
                    let in_range = range.min_sample_rate() <= SampleRate(output_rate)
                        && range.max_sample_rate() >= SampleRate(output_rate);
                    if !in_range {
                        continue;
                    }
                    match range.channels() {
                        1 => caps.output_mono_at_rate = true,
                        2 => caps.output_stereo_at_rate = true,
                        _ => {}
                    }
                }
            }
            Err(e) => tracing::warn!("failed to query output configs: {e}"),
        }
    }

    debug!(?caps, "probed audio capabilities");
    caps
}

#[cfg(not(feature = "audio-cpal"))]
pub fn detect(output_rate: u32) -> DeviceCapabilities {
    DeviceCapabilities {
        probed_output_rate: output_rate,
        ..Default::default()
    }
}

/// Memoising wrapper around a probe function.
pub struct CapabilityCache {
    cached: Mutex<Option<DeviceCapabilities>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Return the cached value for `output_rate`, probing with `probe` on a
    /// miss or when the cached entry was taken at another rate.
    pub fn get_or_detect(
        &self,
        output_rate: u32,
        probe: impl FnOnce(u32) -> DeviceCapabilities,
    ) -> DeviceCapabilities {
        let mut guard = self.cached.lock();
        match guard.as_ref() {
            Some(caps) if caps.probed_output_rate == output_rate => caps.clone(),
            _ => {
                let caps = probe(output_rate);
                *guard = Some(caps.clone());
                caps
            }
        }
    }

    pub fn invalidate(&self) {
        if self.cached.lock().take().is_some() {
            debug!("capability cache invalidated");
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached.lock().is_some()
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

fn global() -> &'static CapabilityCache {
    static CACHE: OnceLock<CapabilityCache> = OnceLock::new();
    CACHE.get_or_init(CapabilityCache::new)
}

/// Process-wide memoised [`detect`].
pub fn capabilities(output_rate: u32) -> DeviceCapabilities {
    global().get_or_detect(output_rate, detect)
}

/// Drop the process-wide cached capabilities (e.g. on a device-change event).
pub fn invalidate() {
    global().invalidate();
}
