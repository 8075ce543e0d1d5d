//! `CpalSink`: plays nodes on the default output device.
//!
//! # Design constraints
//!
//! The output callback runs on the OS audio thread. It never locks: node
//! commands arrive over a bounded crossbeam channel drained with `try_recv`,
//! gain and the sample clock are atomics, and completions leave through
//! `try_send`.
//!
//! The device renders the mono stream either as one channel or duplicated
//! into two, whichever the capability probe says the device accepts at the
//! playback rate. No resampling is done here.
//!
//! # Hand-off
//!
//! `NodeEnded` leaves the callback once a node is within `HANDOFF_LEAD_SECS`
//! (or one callback period, whichever is longer) of its last sample. The
//! engine answers with the next `Start` while the current node still plays;
//! the renderer parks it in a pending slot and switches to it on the frame
//! after the last sample, never before its start frame.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info};

use super::sink::{AudioSink, NodeId, SinkEvent, SinkInfo};
use crate::{
    audio::capability::{self, OutputLayout},
    error::{ParleyError, Result},
};

/// Node commands in flight between the engine and the callback.
const COMMAND_CAP: usize = 16;

/// How far ahead of a node's end the engine is asked for its successor.
const HANDOFF_LEAD_SECS: f64 = 0.05;

enum NodeCommand {
    Start {
        id: NodeId,
        samples: Arc<[f32]>,
        start_frame: u64,
    },
    /// Halts node `id` and anything older, including the tail of a node
    /// that already reported its end.
    Stop {
        id: NodeId,
    },
}

struct PlayingNode {
    id: NodeId,
    samples: Arc<[f32]>,
    pos: usize,
    start_frame: u64,
    /// `NodeEnded` already sent.
    notified: bool,
}

impl PlayingNode {
    /// Frames until the last sample has been rendered, counted from `frame_no`.
    fn frames_left(&self, frame_no: u64) -> u64 {
        let waiting = self.start_frame.saturating_sub(frame_no);
        waiting + self.samples.len().saturating_sub(self.pos) as u64
    }
}

/// State owned by the output callback.
struct Renderer {
    commands: Receiver<NodeCommand>,
    events: Sender<SinkEvent>,
    gain: Arc<AtomicU32>,
    clock: Arc<AtomicU64>,
    last_finished: Arc<AtomicU64>,
    channels: usize,
    lead_frames: u64,
    active: Option<PlayingNode>,
    next: Option<PlayingNode>,
}

impl Renderer {
    fn new(
        commands: Receiver<NodeCommand>,
        events: Sender<SinkEvent>,
        gain: Arc<AtomicU32>,
        clock: Arc<AtomicU64>,
        last_finished: Arc<AtomicU64>,
        channels: usize,
        lead_frames: u64,
    ) -> Self {
        Self {
            commands,
            events,
            gain,
            clock,
            last_finished,
            channels: channels.max(1),
            lead_frames,
            active: None,
            next: None,
        }
    }

    fn render<T>(&mut self, out: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                NodeCommand::Start {
                    id,
                    samples,
                    start_frame,
                } => {
                    let node = PlayingNode {
                        id,
                        samples,
                        pos: 0,
                        start_frame,
                        notified: false,
                    };
                    if self.active.is_none() {
                        self.active = Some(node);
                    } else {
                        self.next = Some(node);
                    }
                }
                NodeCommand::Stop { id } => {
                    halt_through(&mut self.next, id, &self.last_finished);
                    halt_through(&mut self.active, id, &self.last_finished);
                    if self.active.is_none() {
                        self.active = self.next.take();
                    }
                }
            }
        }

        let gain = f32::from_bits(self.gain.load(Ordering::Relaxed));
        let mut frame_no = self.clock.load(Ordering::Relaxed);
        let horizon = self.lead_frames.max((out.len() / self.channels) as u64);

        for frame in out.chunks_mut(self.channels) {
            let value = T::from_sample(self.next_sample(frame_no, horizon) * gain);
            for out in frame.iter_mut() {
                *out = value;
            }
            frame_no += 1;
        }

        self.clock.store(frame_no, Ordering::Relaxed);
    }

    fn next_sample(&mut self, frame_no: u64, horizon: u64) -> f32 {
        let Some(node) = self.active.as_mut() else {
            return 0.0;
        };
        if !node.notified && node.frames_left(frame_no) <= horizon {
            node.notified = true;
            notify_ended(&self.events, node.id);
        }
        if frame_no < node.start_frame {
            return 0.0;
        }

        let sample = node.samples.get(node.pos).copied().unwrap_or(0.0);
        node.pos += 1;
        if node.pos >= node.samples.len() {
            let id = node.id;
            self.last_finished.fetch_max(id, Ordering::Release);
            self.active = self.next.take();
        }
        sample
    }
}

fn halt_through(slot: &mut Option<PlayingNode>, id: NodeId, last_finished: &AtomicU64) {
    if slot.as_ref().is_some_and(|n| n.id <= id) {
        if let Some(node) = slot.take() {
            last_finished.fetch_max(node.id, Ordering::Release);
        }
    }
}

fn notify_ended(events: &Sender<SinkEvent>, id: NodeId) {
    if let Err(TrySendError::Disconnected(_)) = events.try_send(SinkEvent::NodeEnded(id)) {
        error!("playback event channel closed");
    }
}

/// Output sink backed by the default cpal output device.
///
/// **Not `Send`**: holds a `cpal::Stream`. Create it on the thread that runs
/// the engine (see `PlaybackService::spawn`).
pub struct CpalSink {
    events: Sender<SinkEvent>,
    stream: Option<Stream>,
    commands: Option<Sender<NodeCommand>>,
    gain: Arc<AtomicU32>,
    clock: Arc<AtomicU64>,
    last_finished: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalSink {
    pub fn new(events: Sender<SinkEvent>) -> Self {
        Self {
            events,
            stream: None,
            commands: None,
            gain: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            clock: Arc::new(AtomicU64::new(0)),
            last_finished: Arc::new(AtomicU64::new(0)),
            sample_rate: 0,
        }
    }

    fn send(&self, cmd: NodeCommand) -> Result<()> {
        let tx = self.commands.as_ref().ok_or(ParleyError::NotInitialized)?;
        tx.try_send(cmd)
            .map_err(|e| ParleyError::AudioStream(format!("node command rejected: {e}")))
    }
}

impl AudioSink for CpalSink {
    fn open(&mut self, sample_rate: u32) -> Result<SinkInfo> {
        let layout = capability::capabilities(sample_rate)
            .negotiate_output()
            .ok_or_else(|| {
                ParleyError::AudioDevice(format!("no output device can render {sample_rate} Hz"))
            })?;
        let wanted_channels: u16 = match layout {
            OutputLayout::Mono => 1,
            OutputLayout::Stereo => 2,
        };

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ParleyError::AudioDevice("no output device available".into()))?;

        let supported = device
            .supported_output_configs()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?
            .find(|c| {
                c.channels() == wanted_channels
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .ok_or_else(|| ParleyError::AudioDevice("no suitable output config found".into()))?
            .with_sample_rate(SampleRate(sample_rate));

        let format = supported.sample_format();
        let config: StreamConfig = supported.config();

        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_CAP);
        self.clock.store(0, Ordering::Relaxed);
        self.last_finished.store(0, Ordering::Relaxed);

        let renderer = Renderer::new(
            command_rx,
            self.events.clone(),
            Arc::clone(&self.gain),
            Arc::clone(&self.clock),
            Arc::clone(&self.last_finished),
            wanted_channels as usize,
            (HANDOFF_LEAD_SECS * sample_rate as f64).round() as u64,
        );

        let stream = match format {
            SampleFormat::F32 => build_output::<f32>(&device, &config, renderer),
            SampleFormat::I16 => build_output::<i16>(&device, &config, renderer),
            SampleFormat::U16 => build_output::<u16>(&device, &config, renderer),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }?;
        // Some hosts start streams on creation; hold it until resume().
        if let Err(e) = stream.pause() {
            debug!("output stream cannot pause before resume: {e}");
        }

        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate,
            channels = wanted_channels,
            "output stream opened"
        );

        self.stream = Some(stream);
        self.commands = Some(command_tx);
        self.sample_rate = sample_rate;

        Ok(SinkInfo {
            sample_rate,
            layout,
            suspended: true,
        })
    }

    fn resume(&mut self) -> Result<()> {
        let stream = self.stream.as_ref().ok_or(ParleyError::NotInitialized)?;
        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))
    }

    fn current_time(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.clock.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn start_node(&mut self, id: NodeId, samples: Arc<[f32]>, start_at: f64) -> Result<()> {
        let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.send(NodeCommand::Start {
            id,
            samples,
            start_frame,
        })
    }

    fn stop_node(&mut self, id: NodeId) -> Result<()> {
        if self.last_finished.load(Ordering::Acquire) >= id {
            return Err(ParleyError::NodeAlreadyStopped(id));
        }
        self.send(NodeCommand::Stop { id })
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    fn close(&mut self) {
        self.commands = None;
        if self.stream.take().is_some() {
            info!("output stream closed");
        }
    }
}

fn build_output<T>(device: &cpal::Device, config: &StreamConfig, mut renderer: Renderer) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| renderer.render(data),
            |err| error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        renderer: Renderer,
        commands: Sender<NodeCommand>,
        events: Receiver<SinkEvent>,
        last_finished: Arc<AtomicU64>,
    }

    fn harness(lead_frames: u64) -> Harness {
        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_CAP);
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let last_finished = Arc::new(AtomicU64::new(0));
        let renderer = Renderer::new(
            command_rx,
            event_tx,
            Arc::new(AtomicU32::new(1.0f32.to_bits())),
            Arc::new(AtomicU64::new(0)),
            Arc::clone(&last_finished),
            1,
            lead_frames,
        );
        Harness {
            renderer,
            commands: command_tx,
            events: event_rx,
            last_finished,
        }
    }

    fn start(id: NodeId, value: f32, len: usize, start_frame: u64) -> NodeCommand {
        NodeCommand::Start {
            id,
            samples: vec![value; len].into(),
            start_frame,
        }
    }

    impl Harness {
        fn render(&mut self, frames: usize) -> Vec<f32> {
            let mut out = vec![0.0f32; frames];
            self.renderer.render(&mut out);
            out
        }
    }

    #[test]
    fn successor_follows_without_silence() {
        let mut h = harness(0);
        h.commands.send(start(1, 0.25, 100, 0)).unwrap();

        let mut out = h.render(64);
        assert_eq!(h.events.try_recv(), Ok(SinkEvent::NodeEnded(1)));
        assert_eq!(h.last_finished.load(Ordering::Acquire), 0);

        h.commands.send(start(2, 0.5, 100, 100)).unwrap();
        out.extend(h.render(64));
        out.extend(h.render(64));

        assert!(out.iter().all(|s| *s != 0.0), "gap in {out:?}");
        assert!(out[..100].iter().all(|s| *s == 0.25));
        assert!(out[100..].iter().all(|s| *s == 0.5));
        assert_eq!(h.last_finished.load(Ordering::Acquire), 1);
    }

    #[test]
    fn end_is_reported_one_lead_ahead() {
        let mut h = harness(80);
        h.commands.send(start(1, 0.5, 100, 0)).unwrap();

        h.render(16);
        assert!(h.events.try_recv().is_err());
        h.render(16);
        assert_eq!(h.events.try_recv(), Ok(SinkEvent::NodeEnded(1)));

        h.render(128);
        assert!(h.events.try_recv().is_err(), "end is reported once");
    }

    #[test]
    fn node_waits_for_its_start_frame() {
        let mut h = harness(0);
        h.commands.send(start(1, 0.5, 10, 20)).unwrap();

        let out = h.render(64);
        assert!(out[..20].iter().all(|s| *s == 0.0));
        assert!(out[20..30].iter().all(|s| *s == 0.5));
        assert!(out[30..].iter().all(|s| *s == 0.0));
        assert_eq!(h.events.try_recv(), Ok(SinkEvent::NodeEnded(1)));
    }

    #[test]
    fn successor_scheduled_late_keeps_its_start_frame() {
        let mut h = harness(0);
        h.commands.send(start(1, 0.25, 32, 0)).unwrap();
        h.commands.send(start(2, 0.5, 16, 40)).unwrap();

        let out = h.render(64);
        assert!(out[..32].iter().all(|s| *s == 0.25));
        assert!(out[32..40].iter().all(|s| *s == 0.0));
        assert!(out[40..56].iter().all(|s| *s == 0.5));
    }

    #[test]
    fn stop_silences_the_tail_and_the_pending_node() {
        let mut h = harness(0);
        h.commands.send(start(1, 0.25, 100, 0)).unwrap();
        h.render(64);
        assert_eq!(h.events.try_recv(), Ok(SinkEvent::NodeEnded(1)));

        h.commands.send(start(2, 0.5, 100, 100)).unwrap();
        h.commands.send(NodeCommand::Stop { id: 2 }).unwrap();
        let out = h.render(64);

        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(h.last_finished.load(Ordering::Acquire), 2);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn stereo_output_duplicates_the_mono_sample() {
        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_CAP);
        let (event_tx, _event_rx) = crossbeam_channel::unbounded();
        let mut renderer = Renderer::new(
            command_rx,
            event_tx,
            Arc::new(AtomicU32::new(0.5f32.to_bits())),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
            2,
            0,
        );
        command_tx.send(start(1, 0.5, 4, 0)).unwrap();

        let mut out = vec![0i16; 8];
        renderer.render(&mut out);
        assert!(out.chunks(2).all(|f| f[0] == f[1] && f[0] != 0));
    }
}
