//! `PlaybackService`: runs a `PlaybackEngine` on its own event-loop thread.
//!
//! ```text
//! PlaybackHandle ──Command──►┐
//!                            ├─ select! ─► PlaybackEngine ─► AudioSink
//! AudioSink ────SinkEvent───►┘
//! ```
//!
//! Chunk arrival (the producer) and node completion (the consumer) are both
//! handled on this one thread, one message at a time, so the engine needs no
//! locking. The sink is constructed on the loop thread because hardware
//! sinks hold `!Send` streams.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::{
    sink::{AudioSink, SinkEvent},
    PlaybackDiagnostics, PlaybackEngine, PlaybackSnapshot, EVENT_CAP,
};
use crate::{
    config::PlaybackConfig,
    error::{ParleyError, Result},
    ipc::events::{PlaybackEvent, PlaybackStatus},
};

type Reply<T> = Sender<Result<T>>;

enum Command {
    Init(Reply<()>),
    Queue(String, Reply<()>),
    Stop(Reply<()>),
    ClearQueue(Reply<usize>),
    SetVolume(f32, Reply<()>),
    Dispose(Reply<()>),
    Status(Sender<PlaybackStatus>),
    Shutdown,
}

/// Cloneable, `Send` handle to a running service.
#[derive(Clone)]
pub struct PlaybackHandle {
    commands: Sender<Command>,
    events: broadcast::Sender<PlaybackEvent>,
    diagnostics: Arc<PlaybackDiagnostics>,
}

impl PlaybackHandle {
    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(make(tx))
            .map_err(|_| ParleyError::ServiceStopped)?;
        rx.recv().map_err(|_| ParleyError::ServiceStopped)?
    }

    /// Open the output session (also done lazily by the first chunk).
    pub fn init(&self) -> Result<()> {
        self.call(Command::Init)
    }

    /// Decode and enqueue one base64 PCM chunk.
    ///
    /// A `Decode` error means this chunk was dropped; playback of the rest
    /// of the stream is unaffected.
    pub fn queue_audio(&self, chunk: impl Into<String>) -> Result<()> {
        let chunk = chunk.into();
        self.call(|reply| Command::Queue(chunk, reply))
    }

    pub fn stop(&self) -> Result<()> {
        self.call(Command::Stop)
    }

    pub fn clear_queue(&self) -> Result<usize> {
        self.call(Command::ClearQueue)
    }

    pub fn set_volume(&self, level: f32) -> Result<()> {
        self.call(|reply| Command::SetVolume(level, reply))
    }

    /// Stop and release the output session. Only `init()` is accepted
    /// afterwards.
    pub fn dispose(&self) -> Result<()> {
        self.call(Command::Dispose)
    }

    pub fn status(&self) -> Result<PlaybackStatus> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Status(tx))
            .map_err(|_| ParleyError::ServiceStopped)?;
        rx.recv().map_err(|_| ParleyError::ServiceStopped)
    }

    /// Subscribe to `Started` / `Ended` notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> PlaybackSnapshot {
        self.diagnostics.snapshot()
    }
}

/// Owns the loop thread. Dropping it disposes the engine and joins the thread.
pub struct PlaybackService {
    handle: PlaybackHandle,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackService {
    /// Spawn the loop. `make_sink` runs on the loop thread and receives the
    /// sender the sink must use for completions.
    ///
    /// # Errors
    /// `ParleyError::Io` if the thread cannot be spawned.
    pub fn spawn<S, F>(config: PlaybackConfig, make_sink: F) -> Result<Self>
    where
        S: AudioSink + 'static,
        F: FnOnce(Sender<SinkEvent>) -> S + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (events, _) = broadcast::channel(EVENT_CAP);
        let diagnostics = Arc::new(PlaybackDiagnostics::default());

        let loop_events = events.clone();
        let loop_diagnostics = Arc::clone(&diagnostics);
        let thread = std::thread::Builder::new()
            .name("parley-playback".into())
            .spawn(move || {
                let (sink_tx, sink_rx) = crossbeam_channel::unbounded();
                let sink = make_sink(sink_tx.clone());
                let engine =
                    PlaybackEngine::with_channels(config, sink, loop_events, loop_diagnostics);
                // Holding `sink_tx` keeps `sink_rx` connected even if the sink
                // drops its sender.
                run(engine, cmd_rx, sink_rx, sink_tx);
            })?;

        info!("playback service started");
        Ok(Self {
            handle: PlaybackHandle {
                commands: cmd_tx,
                events,
                diagnostics,
            },
            thread: Some(thread),
        })
    }

    /// Spawn with a `CpalSink` on the default output device.
    #[cfg(feature = "audio-cpal")]
    pub fn spawn_default(config: PlaybackConfig) -> Result<Self> {
        Self::spawn(config, super::cpal_sink::CpalSink::new)
    }

    pub fn handle(&self) -> PlaybackHandle {
        self.handle.clone()
    }

    /// Dispose the engine and join the loop thread.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.handle.commands.send(Command::Shutdown);
        if thread.join().is_err() {
            error!("playback loop panicked");
        }
        info!("playback service stopped");
    }
}

impl Drop for PlaybackService {
    fn drop(&mut self) {
        self.join();
    }
}

fn run<S: AudioSink>(
    mut engine: PlaybackEngine<S>,
    commands: Receiver<Command>,
    sink_events: Receiver<SinkEvent>,
    _sink_tx: Sender<SinkEvent>,
) {
    loop {
        crossbeam_channel::select! {
            recv(commands) -> msg => {
                let Ok(cmd) = msg else {
                    debug!("all playback handles dropped");
                    break;
                };
                // select! picks randomly among ready channels; completions
                // that arrived first must be applied before the command.
                while let Ok(SinkEvent::NodeEnded(id)) = sink_events.try_recv() {
                    engine.on_node_ended(id);
                }
                if !handle_command(&mut engine, cmd) {
                    break;
                }
            }
            recv(sink_events) -> ev => {
                if let Ok(SinkEvent::NodeEnded(id)) = ev {
                    engine.on_node_ended(id);
                }
            }
        }
    }
    engine.dispose();
}

/// Returns `false` when the loop should exit.
fn handle_command<S: AudioSink>(engine: &mut PlaybackEngine<S>, cmd: Command) -> bool {
    match cmd {
        Command::Init(reply) => {
            let _ = reply.send(engine.init());
        }
        Command::Queue(chunk, reply) => {
            let _ = reply.send(engine.queue_audio(&chunk));
        }
        Command::Stop(reply) => {
            let _ = reply.send(engine.stop());
        }
        Command::ClearQueue(reply) => {
            let _ = reply.send(engine.clear_queue());
        }
        Command::SetVolume(level, reply) => {
            let _ = reply.send(engine.set_volume(level));
        }
        Command::Dispose(reply) => {
            engine.dispose();
            let _ = reply.send(Ok(()));
        }
        Command::Status(reply) => {
            let _ = reply.send(engine.status());
        }
        Command::Shutdown => return false,
    }
    true
}
