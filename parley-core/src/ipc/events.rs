//! Playback and capture lifecycle events.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Emitted by the playback engine on every idle <-> draining edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub kind: PlaybackEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackEventKind {
    /// Idle → Draining: the first buffer after silence started.
    Started,
    /// Draining → Idle: the queue ran dry, or `stop()` halted playback.
    Ended,
}

/// Current state of a playback engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    /// Output session not yet opened.
    Uninitialized,
    /// Session open, nothing playing.
    Idle,
    /// One node playing; more buffers may be queued.
    Draining,
    /// Session released; only `init()` is accepted.
    Disposed,
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Current state of a capture encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Stopped,
    Capturing,
    /// The input stream failed after capture started.
    Error,
}
