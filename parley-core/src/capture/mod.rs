//! `CaptureEncoder`: microphone → mono PCM16 frames → base64 → transport callback.
//!
//! ## Lifecycle
//!
//! ```text
//! CaptureEncoder::new()
//!     └─► start_capture(stream, on_audio_data)  → worker spawned, graph wired
//!         └─► stop_capture()                     → graph torn down, stream released
//! ```
//!
//! `start_capture` fails with `AlreadyCapturing` while a session is attached.
//! `stop_capture` is idempotent.
//!
//! ## Threading
//!
//! The worker thread owns the input stream (created there because
//! `cpal::Stream` is `!Send`), drains the ring buffer, converts to the capture
//! rate, frames and encodes. `on_audio_data` is invoked on the worker, once
//! per block, strictly in capture order; the worker never re-enters it.

pub mod framer;
pub mod graph;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{resample::RateConverter, InputStream},
    buffering::{create_audio_ring, frame::AudioFrame, AudioConsumer, Consumer},
    config::CaptureConfig,
    error::{ParleyError, Result},
    ipc::events::CaptureStatus,
};

use framer::BlockFramer;
use graph::CaptureGraph;

/// Samples drained from the ring per worker iteration.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY: Duration = Duration::from_millis(5);

/// A microphone stream the caller has already obtained access to.
pub enum MicrophoneStream {
    /// A host input device, reopened on the capture worker.
    Device {
        name: String,
        native_rate: u32,
        preferred: Option<String>,
    },
    /// Samples pushed by the caller into a ring buffer (file playback,
    /// another audio stack, tests).
    Ring {
        consumer: AudioConsumer,
        sample_rate: u32,
        label: String,
    },
}

impl MicrophoneStream {
    /// Acquire the preferred (or default) microphone.
    ///
    /// # Errors
    /// `ParleyError::MediaAccess` when no input device is available or the
    /// host refuses to report a configuration for it.
    #[cfg(feature = "audio-cpal")]
    pub fn acquire(preferred: Option<&str>) -> Result<Self> {
        use cpal::traits::DeviceTrait;

        let device = crate::audio::device::resolve_input_device(preferred)?;
        let name = device
            .name()
            .map_err(|e| ParleyError::MediaAccess(e.to_string()))?;
        let native_rate = device
            .default_input_config()
            .map_err(|e| ParleyError::MediaAccess(e.to_string()))?
            .sample_rate()
            .0;
        info!(device = name.as_str(), native_rate, "microphone acquired");
        Ok(Self::Device {
            name,
            native_rate,
            preferred: preferred.map(str::to_string),
        })
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn acquire(_preferred: Option<&str>) -> Result<Self> {
        Err(ParleyError::MediaAccess(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// Wrap a ring consumer carrying mono samples at `sample_rate`.
    pub fn from_consumer(consumer: AudioConsumer, sample_rate: u32) -> Self {
        Self::Ring {
            consumer,
            sample_rate,
            label: "ring".into(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            MicrophoneStream::Device { name, .. } => name,
            MicrophoneStream::Ring { label, .. } => label,
        }
    }
}

/// Counters for one encoder, reset on every `start_capture`.
#[derive(Default)]
pub struct CaptureDiagnostics {
    pub frames_emitted: AtomicUsize,
    /// Samples read from the ring, at the source rate.
    pub samples_captured: AtomicUsize,
    /// Samples the input callback could not fit in the ring.
    pub samples_dropped: Arc<AtomicUsize>,
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        self.frames_emitted.store(0, Ordering::Relaxed);
        self.samples_captured.store(0, Ordering::Relaxed);
        self.samples_dropped.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub frames_emitted: usize,
    pub samples_captured: usize,
    pub samples_dropped: usize,
}

struct CaptureSession {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    graph: CaptureGraph,
}

/// Turns a live microphone stream into transport-ready base64 PCM frames.
pub struct CaptureEncoder {
    config: CaptureConfig,
    session: Option<CaptureSession>,
    status: Arc<Mutex<CaptureStatus>>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl CaptureEncoder {
    pub fn new(mut config: CaptureConfig) -> Self {
        config.normalize();
        Self {
            config,
            session: None,
            status: Arc::new(Mutex::new(CaptureStatus::Stopped)),
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        }
    }

    /// Attach to `stream` and start emitting frames to `on_audio_data`.
    ///
    /// Blocks until the input is confirmed open. On failure nothing is left
    /// running and the encoder can be started again.
    ///
    /// # Errors
    /// - `ParleyError::AlreadyCapturing` if a session is attached.
    /// - `ParleyError::MediaAccess` / `ParleyError::AudioStream` if the device
    ///   cannot be opened.
    pub fn start_capture<F>(&mut self, stream: MicrophoneStream, on_audio_data: F) -> Result<()>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        if self.session.is_some() {
            return Err(ParleyError::AlreadyCapturing);
        }

        let graph = CaptureGraph::wire(stream.label(), self.config.block_size);
        if graph.is_audible() {
            return Err(ParleyError::AudioStream(
                "capture graph routes microphone audio to an audible output".into(),
            ));
        }

        self.diagnostics.reset();
        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);

        let worker = Worker {
            config: self.config.clone(),
            running: Arc::clone(&running),
            diagnostics: Arc::clone(&self.diagnostics),
            status: Arc::clone(&self.status),
        };

        let handle = std::thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || worker.run(stream, open_tx, on_audio_data))?;

        match open_rx.recv() {
            Ok(Ok(source_rate)) => {
                *self.status.lock() = CaptureStatus::Capturing;
                info!(
                    source_rate,
                    sample_rate = self.config.sample_rate,
                    block_size = self.config.block_size,
                    "capture started"
                );
                self.session = Some(CaptureSession {
                    running,
                    worker: Some(handle),
                    graph,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                *self.status.lock() = CaptureStatus::Error;
                warn!("capture failed to start: {e}");
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(ParleyError::Other(anyhow::anyhow!(
                    "capture worker died before opening the input"
                )))
            }
        }
    }

    /// Tear the graph down in reverse connection order and release the input.
    ///
    /// Safe to call when not capturing.
    pub fn stop_capture(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        for (from, to) in session.graph.disconnect_all() {
            // The source edge goes last; cutting it halts frame delivery.
            if from == "source" {
                session.running.store(false, Ordering::SeqCst);
            }
            debug!(from, to, "capture edge released");
        }
        if let Some(worker) = session.worker.take() {
            if worker.join().is_err() {
                error!("capture worker panicked");
            }
        }
        *self.status.lock() = CaptureStatus::Stopped;
        info!("capture stopped");
    }

    pub fn is_capturing(&self) -> bool {
        self.session.is_some()
    }

    pub fn status(&self) -> CaptureStatus {
        *self.status.lock()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// The live graph, if capturing.
    pub fn graph(&self) -> Option<&CaptureGraph> {
        self.session.as_ref().map(|s| &s.graph)
    }

    pub fn diagnostics_snapshot(&self) -> CaptureSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for CaptureEncoder {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

/// State moved onto the capture thread.
struct Worker {
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    diagnostics: Arc<CaptureDiagnostics>,
    status: Arc<Mutex<CaptureStatus>>,
}

impl Worker {
    fn run<F>(
        self,
        stream: MicrophoneStream,
        open_tx: crossbeam_channel::Sender<Result<u32>>,
        on_audio_data: F,
    ) where
        F: FnMut(AudioFrame),
    {
        match stream {
            MicrophoneStream::Device { preferred, .. } => {
                let (producer, consumer) = create_audio_ring();
                // Must happen on this thread: cpal::Stream is !Send.
                let input = match InputStream::open_with_preference(
                    producer,
                    Arc::clone(&self.running),
                    Arc::clone(&self.diagnostics.samples_dropped),
                    preferred.as_deref(),
                ) {
                    Ok(input) => input,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let rate = input.sample_rate;
                self.drain(consumer, rate, open_tx, on_audio_data);
                input.stop();
                // Stream drops here, releasing the device on this thread.
                drop(input);
            }
            MicrophoneStream::Ring {
                consumer,
                sample_rate,
                ..
            } => self.drain(consumer, sample_rate, open_tx, on_audio_data),
        }
    }

    fn drain<F>(
        &self,
        mut consumer: AudioConsumer,
        source_rate: u32,
        open_tx: crossbeam_channel::Sender<Result<u32>>,
        mut on_audio_data: F,
    ) where
        F: FnMut(AudioFrame),
    {
        let mut converter =
            match RateConverter::new(source_rate, self.config.sample_rate, DRAIN_CHUNK) {
                Ok(c) => c,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };
        let _ = open_tx.send(Ok(source_rate));

        let mut framer = BlockFramer::new(self.config.block_size, self.config.sample_rate);
        let mut raw = vec![0f32; DRAIN_CHUNK];
        let mut converted = Vec::with_capacity(DRAIN_CHUNK * 2);

        while self.running.load(Ordering::Relaxed) {
            let n = consumer.pop_slice(&mut raw);
            if n == 0 {
                std::thread::sleep(SLEEP_EMPTY);
                continue;
            }
            self.diagnostics
                .samples_captured
                .fetch_add(n, Ordering::Relaxed);

            converted.clear();
            converter.process_into(&raw[..n], &mut converted);

            let diagnostics = &self.diagnostics;
            framer.push(&converted, |frame| {
                diagnostics.frames_emitted.fetch_add(1, Ordering::Relaxed);
                on_audio_data(frame);
            });
        }

        if framer.pending() > 0 {
            debug!(discarded = framer.pending(), "partial capture block discarded");
        }
        let mut status = self.status.lock();
        if *status == CaptureStatus::Capturing {
            *status = CaptureStatus::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::Producer;
    use crate::codec;

    fn recv_frame(rx: &crossbeam_channel::Receiver<AudioFrame>) -> AudioFrame {
        rx.recv_timeout(Duration::from_secs(2))
            .expect("timed out waiting for capture frame")
    }

    #[test]
    fn emits_fixed_size_frames_in_order() {
        let (mut producer, consumer) = create_audio_ring();
        let ramp: Vec<f32> = (0..(2 * 256 + 10)).map(|i| (i as f32 / 600.0) - 0.4).collect();
        producer.push_slice(&ramp);

        let mut encoder = CaptureEncoder::new(CaptureConfig {
            block_size: 256,
            ..CaptureConfig::default()
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        encoder
            .start_capture(MicrophoneStream::from_consumer(consumer, 16_000), move |f| {
                let _ = tx.send(f);
            })
            .expect("start capture");
        assert_eq!(encoder.status(), CaptureStatus::Capturing);

        let first = recv_frame(&rx);
        let second = recv_frame(&rx);
        assert_eq!((first.index, second.index), (0, 1));
        assert_eq!(first.samples, 256);

        let decoded = codec::decode_base64(&second.base64).expect("decode");
        for (orig, got) in ramp[256..512].iter().zip(&decoded) {
            assert!((orig - got).abs() <= 2.0 / 32768.0);
        }

        encoder.stop_capture();
        assert!(rx.try_recv().is_err(), "partial block must not be emitted");
        assert_eq!(encoder.diagnostics_snapshot().frames_emitted, 2);
    }

    #[test]
    fn second_start_fails_loudly() {
        let (_p1, c1) = create_audio_ring();
        let (_p2, c2) = create_audio_ring();
        let mut encoder = CaptureEncoder::new(CaptureConfig::default());
        encoder
            .start_capture(MicrophoneStream::from_consumer(c1, 16_000), |_| {})
            .expect("first start");
        let err = encoder
            .start_capture(MicrophoneStream::from_consumer(c2, 16_000), |_| {})
            .unwrap_err();
        assert!(matches!(err, ParleyError::AlreadyCapturing));
        assert!(encoder.is_capturing());
    }

    #[test]
    fn stop_is_idempotent_and_allows_restart() {
        let mut encoder = CaptureEncoder::new(CaptureConfig::default());
        encoder.stop_capture();

        let (_p, c) = create_audio_ring();
        encoder
            .start_capture(MicrophoneStream::from_consumer(c, 16_000), |_| {})
            .expect("start");
        encoder.stop_capture();
        encoder.stop_capture();
        assert_eq!(encoder.status(), CaptureStatus::Stopped);
        assert!(encoder.graph().is_none());

        let (_p, c) = create_audio_ring();
        encoder
            .start_capture(MicrophoneStream::from_consumer(c, 16_000), |_| {})
            .expect("restart");
    }

    #[test]
    fn live_graph_never_reaches_an_audible_destination() {
        let (_p, c) = create_audio_ring();
        let mut encoder = CaptureEncoder::new(CaptureConfig::default());
        encoder
            .start_capture(MicrophoneStream::from_consumer(c, 16_000), |_| {})
            .expect("start");
        let graph = encoder.graph().expect("graph while capturing");
        assert_eq!(graph.output_path_gain(), Some(0.0));
        assert!(!graph.is_audible());
    }

    #[test]
    fn resamples_native_rate_to_capture_rate() {
        let (mut producer, consumer) = create_audio_ring();
        // 0.5 s at 48 kHz → 8000 samples at 16 kHz → at least one 4096 frame.
        producer.push_slice(&vec![0.1f32; 24_000]);

        let mut encoder = CaptureEncoder::new(CaptureConfig::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        encoder
            .start_capture(MicrophoneStream::from_consumer(consumer, 48_000), move |f| {
                let _ = tx.send(f);
            })
            .expect("start");
        let frame = recv_frame(&rx);
        assert_eq!(frame.sample_rate, 16_000);
        assert_eq!(frame.samples, 4096);
    }
}
