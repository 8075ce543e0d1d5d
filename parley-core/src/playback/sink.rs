//! The hardware seam of the playback engine.
//!
//! A sink plays one-shot "nodes": a buffer bound to a start time on the
//! sink's clock. It reports completion asynchronously by sending
//! `SinkEvent::NodeEnded` on the channel it was constructed with; the engine
//! never waits on it.

use std::sync::Arc;

use crate::audio::capability::OutputLayout;
use crate::error::Result;

/// Identifies one playback node. Strictly increasing per engine.
pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// The node is about to render its last sample: sent at most one
    /// hand-off lead (sink specific) before the end and never after it, so
    /// the engine can start the successor in time. Sent once per node; not
    /// sent for nodes halted by `stop_node` before that point.
    NodeEnded(NodeId),
}

/// What the sink negotiated when it opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkInfo {
    pub sample_rate: u32,
    pub layout: OutputLayout,
    /// The session was created paused and needs `resume()`.
    pub suspended: bool,
}

/// Contract for audio output backends.
pub trait AudioSink {
    /// Open the output session at `sample_rate` (mono source material).
    ///
    /// # Errors
    /// Returns an error if no output can render the rate.
    fn open(&mut self, sample_rate: u32) -> Result<SinkInfo>;

    /// Start a suspended session. May complete asynchronously.
    fn resume(&mut self) -> Result<()>;

    /// Current position of the sink clock, in seconds since `open`.
    fn current_time(&self) -> f64;

    /// Bind `samples` to node `id` and start it at `start_at` seconds on the
    /// sink clock (immediately if that time has passed).
    fn start_node(&mut self, id: NodeId, samples: Arc<[f32]>, start_at: f64) -> Result<()>;

    /// Halt node `id`.
    ///
    /// # Errors
    /// `ParleyError::NodeAlreadyStopped` when the node already finished.
    fn stop_node(&mut self, id: NodeId) -> Result<()>;

    /// Output gain in [0, 1], applied to in-flight and future nodes at once.
    fn set_gain(&mut self, gain: f32);

    /// Release the output session.
    fn close(&mut self);
}
