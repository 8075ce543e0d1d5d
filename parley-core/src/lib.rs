//! # parley-core
//!
//! Real-time audio I/O for voice conversations.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → InputStream → SPSC RingBuffer → capture worker
//!                                                   │
//!                                      RateConverter → BlockFramer
//!                                                   │
//!                                    PCM16 → base64 → on_audio_data
//!
//! base64 chunk → PlaybackEngine::queue_audio → FIFO of DecodedBuffer
//!                                                   │
//!                                  one node at a time on an AudioSink
//!                                                   │
//!                                   broadcast::Sender<PlaybackEvent>
//! ```
//!
//! The input callback is zero-alloc. All heap work happens on the capture
//! worker and the playback loop thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
pub mod playback;

// Convenience re-exports for downstream crates
pub use buffering::frame::{AudioFrame, DecodedBuffer};
pub use capture::{CaptureEncoder, MicrophoneStream};
pub use config::{CaptureConfig, PlaybackConfig};
pub use error::{ParleyError, Result};
pub use ipc::events::{CaptureStatus, PlaybackEvent, PlaybackEventKind, PlaybackStatus};
pub use playback::{
    recording::RecordingSink,
    service::{PlaybackHandle, PlaybackService},
    sink::{AudioSink, SinkEvent},
    PlaybackEngine,
};

#[cfg(feature = "audio-cpal")]
pub use playback::cpal_sink::CpalSink;
