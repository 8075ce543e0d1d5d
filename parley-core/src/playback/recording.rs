//! `RecordingSink`: an in-memory sink that records every call.
//!
//! Used to drive the engine without hardware: tests (and hosts that want to
//! inspect scheduling) read the recorded timeline and deliver completions by
//! hand with `PlaybackEngine::on_node_ended` or through the service's sink
//! event channel.

use std::sync::Arc;

use parking_lot::Mutex;

use super::sink::{AudioSink, NodeId, SinkInfo};
use crate::audio::capability::OutputLayout;
use crate::error::{ParleyError, Result};

/// One `start_node` call.
#[derive(Debug, Clone)]
pub struct RecordedNode {
    pub id: NodeId,
    pub start_at: f64,
    pub samples: Arc<[f32]>,
    /// Set by `stop_node`.
    pub stopped: bool,
    /// Set by `mark_ended`.
    pub ended: bool,
}

impl RecordedNode {
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate as f64
    }
}

#[derive(Debug, Default)]
pub struct RecordingState {
    pub opened_at_rate: Option<u32>,
    pub open_count: usize,
    pub resumed: bool,
    pub closed: bool,
    pub gain: f32,
    pub now: f64,
    pub nodes: Vec<RecordedNode>,
    /// Highest number of nodes started but neither stopped nor ended.
    pub max_live: usize,
    /// Make the next `open` fail.
    pub fail_open: bool,
    /// Report the session as created suspended.
    pub start_suspended: bool,
    /// Refuse this many upcoming `start_node` calls.
    pub refuse_starts: usize,
}

impl RecordingState {
    pub fn live(&self) -> usize {
        self.nodes.iter().filter(|n| !n.stopped && !n.ended).count()
    }

    /// Concatenation of every node's samples in start order.
    pub fn rendered(&self) -> Vec<f32> {
        self.nodes
            .iter()
            .flat_map(|n| n.samples.iter().copied())
            .collect()
    }

    /// The node currently playing, if any.
    pub fn active(&self) -> Option<&RecordedNode> {
        self.nodes.iter().rev().find(|n| !n.stopped && !n.ended)
    }
}

/// Cloneable: clones share the same recorded state.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the recorded state.
    pub fn state(&self) -> Arc<Mutex<RecordingState>> {
        Arc::clone(&self.state)
    }

    /// Record that node `id` finished on its own. The caller still has to
    /// deliver the completion to the engine.
    pub fn mark_ended(&self, id: NodeId) {
        let mut st = self.state.lock();
        if let Some(node) = st.nodes.iter_mut().find(|n| n.id == id) {
            node.ended = true;
        }
    }

    pub fn set_now(&self, now: f64) {
        self.state.lock().now = now;
    }
}

impl AudioSink for RecordingSink {
    fn open(&mut self, sample_rate: u32) -> Result<SinkInfo> {
        let mut st = self.state.lock();
        if st.fail_open {
            st.fail_open = false;
            return Err(ParleyError::AudioDevice("recording sink refused to open".into()));
        }
        st.opened_at_rate = Some(sample_rate);
        st.open_count += 1;
        st.closed = false;
        st.resumed = !st.start_suspended;
        Ok(SinkInfo {
            sample_rate,
            layout: OutputLayout::Mono,
            suspended: st.start_suspended,
        })
    }

    fn resume(&mut self) -> Result<()> {
        self.state.lock().resumed = true;
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.state.lock().now
    }

    fn start_node(&mut self, id: NodeId, samples: Arc<[f32]>, start_at: f64) -> Result<()> {
        let mut st = self.state.lock();
        if st.refuse_starts > 0 {
            st.refuse_starts -= 1;
            return Err(ParleyError::AudioStream(format!(
                "recording sink refused node {id}"
            )));
        }
        st.nodes.push(RecordedNode {
            id,
            start_at,
            samples,
            stopped: false,
            ended: false,
        });
        let live = st.live();
        st.max_live = st.max_live.max(live);
        Ok(())
    }

    fn stop_node(&mut self, id: NodeId) -> Result<()> {
        let mut st = self.state.lock();
        match st.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) if !node.stopped && !node.ended => {
                node.stopped = true;
                Ok(())
            }
            _ => Err(ParleyError::NodeAlreadyStopped(id)),
        }
    }

    fn set_gain(&mut self, gain: f32) {
        self.state.lock().gain = gain;
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }
}
