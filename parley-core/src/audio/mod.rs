//! Microphone input via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (after the first callback sizes the mix buffer)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The callback downmixes to mono and writes into an SPSC ring buffer
//! producer whose `push_slice` is lock-free and allocation-free. Framing,
//! resampling and base64 work happen on the capture worker.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! `InputStream` therefore must be created and dropped on the same thread.
//! The capture worker opens it on its own thread and drops it there.

pub mod capability;
pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};

use crate::{
    buffering::AudioProducer,
    error::{ParleyError, Result},
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an open input stream feeding a ring buffer.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
pub struct InputStream {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag; `false` makes the callback a no-op.
    running: Arc<AtomicBool>,
    /// Native rate reported by the device (Hz).
    pub sample_rate: u32,
    /// Device name, for logs.
    pub device_name: String,
}

impl InputStream {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available one.
    ///
    /// Mono-downmixed f32 samples at the device's native rate are pushed into
    /// `producer`. Samples that do not fit are counted in `dropped`.
    ///
    /// # Errors
    /// `ParleyError::MediaAccess` when no device can be opened,
    /// `ParleyError::AudioStream` for unsupported formats or stream failures.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        dropped: Arc<AtomicUsize>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let device = device::resolve_input_device(preferred_device_name)?;
        let device_name = device.name().unwrap_or_default();

        info!(device = device_name.as_str(), "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::MediaAccess(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, "input config selected");

        let config: StreamConfig = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_mono_stream::<f32>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                dropped,
            ),
            SampleFormat::I16 => build_mono_stream::<i16>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                dropped,
            ),
            SampleFormat::U16 => build_mono_stream::<u16>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                dropped,
            ),
            SampleFormat::U8 => build_mono_stream::<u8>(
                &device,
                &config,
                producer,
                Arc::clone(&running),
                dropped,
            ),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => {
                ParleyError::MediaAccess("input device disappeared".into())
            }
            other => ParleyError::AudioStream(other.to_string()),
        })?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
            device_name,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Build an input stream for sample type `T`, downmixing every frame to mono.
#[cfg(feature = "audio-cpal")]
fn build_mono_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    use crate::buffering::Producer;

    let ch = config.channels.max(1) as usize;
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let mut sum = 0f32;
                    for c in 0..ch {
                        sum += data[base + c].to_sample::<f32>();
                    }
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    dropped.fetch_add(mix_buf.len() - written, Ordering::Relaxed);
                    warn!("capture ring full: dropped {} frames", mix_buf.len() - written);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                ParleyError::MediaAccess("input device not available".into())
            }
            other => ParleyError::AudioStream(other.to_string()),
        })
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl InputStream {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _dropped: Arc<AtomicUsize>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(ParleyError::MediaAccess(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(all(test, not(feature = "audio-cpal")))]
mod tests {
    use super::*;
    use crate::buffering::create_audio_ring;

    #[test]
    fn input_is_unavailable_without_cpal() {
        let (producer, _consumer) = create_audio_ring();
        let result = InputStream::open_with_preference(
            producer,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicUsize::new(0)),
            None,
        );
        assert!(matches!(result, Err(ParleyError::MediaAccess(_))));
    }
}
