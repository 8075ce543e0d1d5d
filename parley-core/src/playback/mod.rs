//! `PlaybackEngine`: gapless, in-order playback of asynchronously arriving
//! base64 PCM chunks through a single sink.
//!
//! ## Transition table
//!
//! ```text
//! state          event                          next       side effects
//! ─────────────  ─────────────────────────────  ─────────  ─────────────────────────────────
//! Uninitialized  init()                         Idle       open sink, resume if suspended
//! Uninitialized  queue_audio(c)                 Draining   init(), then as Idle below
//! Idle           queue_audio(c)                 Draining   enqueue, start head now, Started
//! Draining       queue_audio(c)                 Draining   enqueue at tail
//! Draining       node ended, queue non-empty    Draining   start head at previous end time
//! Draining       node ended, queue empty        Idle       Ended
//! Idle|Draining  stop()                         Idle       halt node, clear queue, Ended if
//!                                                          it was draining
//! any but Disp.  dispose()                      Disposed   stop(), close sink
//! Disposed       init()                         Idle       reopen sink
//! Disposed       anything else                  Disposed   Err(Disposed)
//! ```
//!
//! At most one node is bound to the sink at any time. `playing` is the only
//! place that records it, and every path that starts a node first checks it
//! is `None` inside the same call.

pub mod recording;
pub mod service;
pub mod sink;

#[cfg(feature = "audio-cpal")]
pub mod cpal_sink;

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::capability,
    buffering::frame::DecodedBuffer,
    config::PlaybackConfig,
    error::{ParleyError, Result},
    ipc::events::{PlaybackEvent, PlaybackEventKind, PlaybackStatus},
};

use sink::{AudioSink, NodeId};

/// Broadcast channel capacity for lifecycle events.
pub const EVENT_CAP: usize = 64;

/// Shared playback counters.
#[derive(Default)]
pub struct PlaybackDiagnostics {
    pub chunks_queued: AtomicUsize,
    pub chunks_rejected: AtomicUsize,
    /// `start_node` calls the sink refused; the buffer stayed queued.
    pub nodes_refused: AtomicUsize,
    pub nodes_started: AtomicUsize,
    pub nodes_ended: AtomicUsize,
    pub active_nodes: AtomicUsize,
    pub max_active_nodes: AtomicUsize,
}

impl PlaybackDiagnostics {
    pub fn reset(&self) {
        self.chunks_queued.store(0, Ordering::Relaxed);
        self.chunks_rejected.store(0, Ordering::Relaxed);
        self.nodes_refused.store(0, Ordering::Relaxed);
        self.nodes_started.store(0, Ordering::Relaxed);
        self.nodes_ended.store(0, Ordering::Relaxed);
        self.active_nodes.store(0, Ordering::Relaxed);
        self.max_active_nodes.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            chunks_queued: self.chunks_queued.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            nodes_refused: self.nodes_refused.load(Ordering::Relaxed),
            nodes_started: self.nodes_started.load(Ordering::Relaxed),
            nodes_ended: self.nodes_ended.load(Ordering::Relaxed),
            active_nodes: self.active_nodes.load(Ordering::Relaxed),
            max_active_nodes: self.max_active_nodes.load(Ordering::Relaxed),
        }
    }

    fn node_started(&self) {
        self.nodes_started.fetch_add(1, Ordering::Relaxed);
        let active = self.active_nodes.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_active_nodes.fetch_max(active, Ordering::Relaxed);
    }

    fn node_ended(&self) {
        self.nodes_ended.fetch_add(1, Ordering::Relaxed);
        self.active_nodes.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub chunks_queued: usize,
    pub chunks_rejected: usize,
    pub nodes_refused: usize,
    pub nodes_started: usize,
    pub nodes_ended: usize,
    pub active_nodes: usize,
    pub max_active_nodes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Uninitialized,
    Open,
    Disposed,
}

/// The node currently bound to the sink.
#[derive(Debug, Clone, Copy)]
struct ActiveNode {
    id: NodeId,
    start_at: f64,
    end_at: f64,
}

pub struct PlaybackEngine<S: AudioSink> {
    config: PlaybackConfig,
    sink: S,
    session: Session,
    queue: VecDeque<DecodedBuffer>,
    /// The "a node is playing" flag.
    playing: Option<ActiveNode>,
    volume: f32,
    next_node_id: NodeId,
    event_seq: u64,
    event_tx: broadcast::Sender<PlaybackEvent>,
    diagnostics: Arc<PlaybackDiagnostics>,
}

impl<S: AudioSink> PlaybackEngine<S> {
    /// Create an engine. The sink is not opened until `init()` or the first
    /// `queue_audio`.
    pub fn new(config: PlaybackConfig, sink: S) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAP);
        Self::with_channels(config, sink, event_tx, Arc::new(PlaybackDiagnostics::default()))
    }

    /// Create an engine publishing on an existing event channel and counters.
    pub fn with_channels(
        mut config: PlaybackConfig,
        sink: S,
        event_tx: broadcast::Sender<PlaybackEvent>,
        diagnostics: Arc<PlaybackDiagnostics>,
    ) -> Self {
        config.normalize();
        let volume = config.initial_volume;
        Self {
            config,
            sink,
            session: Session::Uninitialized,
            queue: VecDeque::new(),
            playing: None,
            volume,
            next_node_id: 1,
            event_seq: 0,
            event_tx,
            diagnostics,
        }
    }

    /// Open the output session. No-op when already open.
    ///
    /// # Errors
    /// Whatever the sink reports when it cannot open; the engine stays in its
    /// previous state and the capability cache is invalidated.
    pub fn init(&mut self) -> Result<()> {
        if self.session == Session::Open {
            return Ok(());
        }
        let info = match self.sink.open(self.config.sample_rate) {
            Ok(info) => info,
            Err(e) => {
                capability::invalidate();
                error!("failed to open playback session: {e}");
                return Err(e);
            }
        };
        if info.suspended {
            debug!("playback session created suspended, resuming");
            if let Err(e) = self.sink.resume() {
                self.sink.close();
                return Err(e);
            }
        }
        self.sink.set_gain(self.volume);
        self.session = Session::Open;
        info!(
            sample_rate = info.sample_rate,
            layout = ?info.layout,
            "playback session ready"
        );
        Ok(())
    }

    /// Decode `chunk` and append it to the queue, starting playback if idle.
    ///
    /// # Errors
    /// - `ParleyError::Disposed` after `dispose()`.
    /// - `ParleyError::Decode` for a malformed chunk. The chunk is dropped;
    ///   the queue and any playing node are untouched.
    /// - Sink errors from the implicit `init()`.
    /// - Sink errors from starting playback. The chunk is already queued and
    ///   stays there (behind any older held buffers); the next `queue_audio`
    ///   retries the head. Do not resend it.
    pub fn queue_audio(&mut self, chunk: &str) -> Result<()> {
        match self.session {
            Session::Disposed => return Err(ParleyError::Disposed),
            Session::Uninitialized => self.init()?,
            Session::Open => {}
        }

        let buffer = match DecodedBuffer::from_base64(chunk, self.config.sample_rate) {
            Ok(b) => b,
            Err(e) => {
                self.diagnostics
                    .chunks_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!("dropping audio chunk: {e}");
                return Err(e);
            }
        };
        if buffer.is_empty() {
            debug!("ignoring empty audio chunk");
            return Ok(());
        }

        self.queue.push_back(buffer);
        self.diagnostics.chunks_queued.fetch_add(1, Ordering::Relaxed);

        if self.playing.is_none() {
            let now = self.sink.current_time();
            if self.start_next(now)? {
                self.emit(PlaybackEventKind::Started);
            }
        }
        Ok(())
    }

    /// Completion from the sink. Stale ids (nodes already halted by `stop()`)
    /// are ignored.
    pub fn on_node_ended(&mut self, id: NodeId) {
        let Some(active) = self.playing else {
            debug!(node = id, "ignoring completion while idle");
            return;
        };
        if active.id != id {
            debug!(node = id, active = active.id, "ignoring stale completion");
            return;
        }

        self.playing = None;
        self.diagnostics.node_ended();

        match self.start_next(active.end_at) {
            Ok(true) => {}
            Ok(false) => {
                debug!("queue drained");
                self.emit(PlaybackEventKind::Ended);
            }
            Err(e) => {
                error!(queued = self.queue.len(), "holding queue, next node refused: {e}");
                self.emit(PlaybackEventKind::Ended);
            }
        }
    }

    /// Halt the playing node and discard everything queued.
    ///
    /// # Errors
    /// `ParleyError::Disposed` after `dispose()`. Stopping while idle is `Ok`.
    pub fn stop(&mut self) -> Result<()> {
        if self.session == Session::Disposed {
            return Err(ParleyError::Disposed);
        }
        let discarded = self.queue.len();
        self.queue.clear();

        if let Some(active) = self.playing.take() {
            match self.sink.stop_node(active.id) {
                Ok(()) => {}
                Err(ParleyError::NodeAlreadyStopped(_)) => {
                    debug!(node = active.id, "node already stopped");
                }
                Err(e) => warn!(node = active.id, "failed to stop node: {e}"),
            }
            self.diagnostics.node_ended();
            info!(discarded, "playback stopped");
            self.emit(PlaybackEventKind::Ended);
        }
        Ok(())
    }

    /// Discard queued buffers that have not started. The playing node
    /// finishes normally. Returns how many buffers were discarded.
    ///
    /// # Errors
    /// `ParleyError::Disposed` after `dispose()`.
    pub fn clear_queue(&mut self) -> Result<usize> {
        if self.session == Session::Disposed {
            return Err(ParleyError::Disposed);
        }
        let discarded = self.queue.len();
        self.queue.clear();
        if discarded > 0 {
            debug!(discarded, "playback queue cleared");
        }
        Ok(discarded)
    }

    /// Set the output gain, clamped to [0, 1]. Applies to the playing node
    /// immediately.
    ///
    /// # Errors
    /// `ParleyError::Disposed` after `dispose()`.
    pub fn set_volume(&mut self, level: f32) -> Result<()> {
        if self.session == Session::Disposed {
            return Err(ParleyError::Disposed);
        }
        self.volume = if level.is_nan() {
            0.0
        } else {
            level.clamp(0.0, 1.0)
        };
        if self.session == Session::Open {
            self.sink.set_gain(self.volume);
        }
        Ok(())
    }

    /// Stop and release the output session. Only `init()` is accepted
    /// afterwards. Disposing twice is a no-op.
    pub fn dispose(&mut self) {
        if self.session == Session::Disposed {
            return;
        }
        // Cannot fail: the session is not disposed yet.
        let _ = self.stop();
        if self.session == Session::Open {
            self.sink.close();
        }
        self.session = Session::Disposed;
        info!("playback engine disposed");
    }

    pub fn status(&self) -> PlaybackStatus {
        match self.session {
            Session::Uninitialized => PlaybackStatus::Uninitialized,
            Session::Disposed => PlaybackStatus::Disposed,
            Session::Open if self.playing.is_some() => PlaybackStatus::Draining,
            Session::Open => PlaybackStatus::Idle,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    /// Scheduled start of the playing node, if any.
    pub fn active_start_time(&self) -> Option<f64> {
        self.playing.map(|n| n.start_at)
    }

    /// Buffers waiting behind the playing node.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.event_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> PlaybackSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Bind the queue head to a new node starting at `start_at`. Returns
    /// whether a node is now playing. A buffer the sink refuses stays at the
    /// head of the queue.
    fn start_next(&mut self, start_at: f64) -> Result<bool> {
        debug_assert!(self.playing.is_none());
        let Some(buffer) = self.queue.front() else {
            return Ok(false);
        };
        let samples = buffer.shared_samples();
        let end_at = start_at + buffer.duration_secs();

        let id = self.next_node_id;
        self.next_node_id += 1;
        if let Err(e) = self.sink.start_node(id, samples, start_at) {
            self.diagnostics.nodes_refused.fetch_add(1, Ordering::Relaxed);
            warn!(node = id, queued = self.queue.len(), "sink refused node: {e}");
            return Err(e);
        }

        self.queue.pop_front();
        self.playing = Some(ActiveNode {
            id,
            start_at,
            end_at,
        });
        self.diagnostics.node_started();
        debug!(node = id, start_at, end_at, queued = self.queue.len(), "node started");
        Ok(true)
    }

    fn emit(&mut self, kind: PlaybackEventKind) {
        self.event_seq += 1;
        debug!(?kind, seq = self.event_seq, "playback event");
        let _ = self.event_tx.send(PlaybackEvent {
            seq: self.event_seq,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::recording::RecordingSink;
    use super::*;
    use crate::codec;

    fn engine() -> (PlaybackEngine<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::new();
        (
            PlaybackEngine::new(PlaybackConfig::default(), sink.clone()),
            sink,
        )
    }

    fn chunk(value: f32, len: usize) -> String {
        codec::encode_base64(&vec![value; len])
    }

    #[test]
    fn first_chunk_initializes_lazily() {
        let (mut engine, sink) = engine();
        assert_eq!(engine.status(), PlaybackStatus::Uninitialized);
        engine.queue_audio(&chunk(0.1, 240)).expect("queue");
        assert_eq!(sink.state().lock().opened_at_rate, Some(24_000));
        assert_eq!(engine.status(), PlaybackStatus::Draining);
    }

    #[test]
    fn suspended_session_is_resumed() {
        let sink = RecordingSink::new();
        sink.state().lock().start_suspended = true;
        let mut engine = PlaybackEngine::new(PlaybackConfig::default(), sink.clone());
        engine.init().expect("init");
        assert!(sink.state().lock().resumed);
        assert_eq!(engine.status(), PlaybackStatus::Idle);
    }

    #[test]
    fn failed_open_leaves_engine_uninitialized() {
        let sink = RecordingSink::new();
        sink.state().lock().fail_open = true;
        let mut engine = PlaybackEngine::new(PlaybackConfig::default(), sink);
        assert!(engine.init().is_err());
        assert_eq!(engine.status(), PlaybackStatus::Uninitialized);
        engine.init().expect("second attempt opens");
    }

    #[test]
    fn stale_completion_is_ignored() {
        let (mut engine, _sink) = engine();
        engine.queue_audio(&chunk(0.1, 240)).expect("queue");
        engine.on_node_ended(99);
        assert!(engine.is_playing());
    }

    #[test]
    fn clear_queue_keeps_playing_node() {
        let (mut engine, sink) = engine();
        for _ in 0..3 {
            engine.queue_audio(&chunk(0.1, 240)).expect("queue");
        }
        assert_eq!(engine.clear_queue().expect("clear"), 2);
        assert!(engine.is_playing());

        let mut events = engine.subscribe_events();
        sink.mark_ended(1);
        engine.on_node_ended(1);
        assert_eq!(engine.status(), PlaybackStatus::Idle);
        assert_eq!(
            events.try_recv().expect("ended event").kind,
            PlaybackEventKind::Ended
        );
        assert_eq!(sink.state().lock().nodes.len(), 1);
    }

    #[test]
    fn volume_is_clamped_and_applied_immediately() {
        let (mut engine, sink) = engine();
        engine.set_volume(3.0).expect("volume");
        assert_eq!(engine.volume(), 1.0);
        engine.init().expect("init");
        assert_eq!(sink.state().lock().gain, 1.0);

        engine.queue_audio(&chunk(0.1, 240)).expect("queue");
        engine.set_volume(-0.5).expect("volume");
        assert_eq!(sink.state().lock().gain, 0.0);
        engine.set_volume(f32::NAN).expect("volume");
        assert_eq!(engine.volume(), 0.0);
        engine.set_volume(0.4).expect("volume");
        assert_eq!(sink.state().lock().gain, 0.4);
    }

    #[test]
    fn disposed_engine_rejects_everything_but_init() {
        let (mut engine, sink) = engine();
        engine.queue_audio(&chunk(0.1, 240)).expect("queue");
        engine.dispose();
        assert!(sink.state().lock().closed);
        assert_eq!(engine.status(), PlaybackStatus::Disposed);

        assert!(matches!(
            engine.queue_audio(&chunk(0.1, 240)),
            Err(ParleyError::Disposed)
        ));
        assert!(matches!(engine.stop(), Err(ParleyError::Disposed)));
        assert!(matches!(engine.clear_queue(), Err(ParleyError::Disposed)));
        assert!(matches!(engine.set_volume(0.5), Err(ParleyError::Disposed)));
        engine.dispose();

        engine.init().expect("re-init");
        assert_eq!(engine.status(), PlaybackStatus::Idle);
        assert_eq!(sink.state().lock().open_count, 2);
        engine.queue_audio(&chunk(0.1, 240)).expect("queue after re-init");
    }

    #[test]
    fn refused_node_keeps_buffer_queued() {
        let (mut engine, sink) = engine();
        engine.init().expect("init");
        sink.state().lock().refuse_starts = 1;

        let err = engine.queue_audio(&chunk(0.1, 240)).unwrap_err();
        assert!(matches!(err, ParleyError::AudioStream(_)));
        assert_eq!(engine.status(), PlaybackStatus::Idle);
        assert_eq!(engine.queued(), 1);

        engine.queue_audio(&chunk(0.2, 240)).expect("retry with next chunk");
        assert_eq!(engine.queued(), 1);
        let snapshot = engine.diagnostics_snapshot();
        assert_eq!(snapshot.nodes_refused, 1);
        assert_eq!(snapshot.chunks_queued, 2);

        let state = sink.state();
        let first = state.lock().active().map(|n| n.samples[0]).expect("playing");
        approx::assert_abs_diff_eq!(first, 0.1, epsilon = 1.0 / 32768.0);
    }

    #[test]
    fn refusal_at_handoff_holds_the_queue() {
        let (mut engine, sink) = engine();
        let mut events = engine.subscribe_events();
        engine.queue_audio(&chunk(0.1, 240)).expect("first");
        engine.queue_audio(&chunk(0.2, 240)).expect("second");

        sink.state().lock().refuse_starts = 1;
        sink.mark_ended(1);
        engine.on_node_ended(1);
        assert_eq!(engine.status(), PlaybackStatus::Idle);
        assert_eq!(engine.queued(), 1);

        engine.queue_audio(&chunk(0.3, 240)).expect("third");
        assert_eq!(engine.queued(), 1);
        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                PlaybackEventKind::Started,
                PlaybackEventKind::Ended,
                PlaybackEventKind::Started,
            ]
        );
        let state = sink.state();
        let playing = state.lock().active().map(|n| n.samples[0]).expect("playing");
        approx::assert_abs_diff_eq!(playing, 0.2, epsilon = 1.0 / 32768.0);
    }

    #[test]
    fn empty_chunk_is_ignored() {
        let (mut engine, sink) = engine();
        engine.queue_audio("").expect("empty chunk");
        assert_eq!(engine.status(), PlaybackStatus::Idle);
        assert!(sink.state().lock().nodes.is_empty());
    }
}
