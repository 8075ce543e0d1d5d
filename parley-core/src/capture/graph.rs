//! Explicit wiring of the capture pipeline.
//!
//! ```text
//! Source ──► BlockProcessor ──► Gain(0.0) ──► Destination
//! ```
//!
//! The processor only exists to produce frames. Its output still has to end
//! somewhere, and that somewhere must be silent: a non-zero path to the
//! destination plays the microphone back through the speakers. `wire()`
//! always inserts a zero gain stage, and `CaptureEncoder` refuses to start on
//! a graph whose output is audible.

use serde::{Deserialize, Serialize};

/// Gain of the monitor stage between the processor and the destination.
pub const MONITOR_GAIN: f32 = 0.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GraphNode {
    Source { device: String },
    BlockProcessor { block_size: usize },
    Gain { gain: f32 },
    Destination,
}

impl GraphNode {
    pub fn label(&self) -> &'static str {
        match self {
            GraphNode::Source { .. } => "source",
            GraphNode::BlockProcessor { .. } => "processor",
            GraphNode::Gain { .. } => "gain",
            GraphNode::Destination => "destination",
        }
    }
}

/// A linear chain of nodes; `nodes[i]` feeds `nodes[i + 1]` while connected.
#[derive(Debug, Clone)]
pub struct CaptureGraph {
    nodes: Vec<GraphNode>,
    /// Number of live edges, counted from the source.
    connected_edges: usize,
}

impl CaptureGraph {
    /// Build and connect the standard capture chain with a muted monitor.
    pub fn wire(device: impl Into<String>, block_size: usize) -> Self {
        Self::from_nodes(vec![
            GraphNode::Source {
                device: device.into(),
            },
            GraphNode::BlockProcessor { block_size },
            GraphNode::Gain { gain: MONITOR_GAIN },
            GraphNode::Destination,
        ])
    }

    /// Connect an arbitrary chain in order.
    pub fn from_nodes(nodes: Vec<GraphNode>) -> Self {
        let connected_edges = nodes.len().saturating_sub(1);
        for pair in nodes.windows(2) {
            tracing::debug!(from = pair[0].label(), to = pair[1].label(), "capture node connected");
        }
        Self {
            nodes,
            connected_edges,
        }
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Live edges in connection order.
    pub fn connections(&self) -> impl Iterator<Item = (&GraphNode, &GraphNode)> {
        self.nodes
            .windows(2)
            .take(self.connected_edges)
            .map(|pair| (&pair[0], &pair[1]))
    }

    /// Product of every gain stage between the processor and the destination,
    /// or `None` when the processor output does not reach a destination.
    pub fn output_path_gain(&self) -> Option<f32> {
        let processor = self
            .nodes
            .iter()
            .position(|n| matches!(n, GraphNode::BlockProcessor { .. }))?;
        let mut gain = 1.0f32;
        for (idx, node) in self.nodes.iter().enumerate().skip(processor + 1) {
            // Edge idx-1 → idx must be live to keep walking.
            if idx > self.connected_edges {
                return None;
            }
            match node {
                GraphNode::Gain { gain: g } => gain *= g,
                GraphNode::Destination => return Some(gain),
                _ => {}
            }
        }
        None
    }

    /// True when microphone audio could be heard at the destination.
    pub fn is_audible(&self) -> bool {
        self.output_path_gain().map(|g| g != 0.0).unwrap_or(false)
    }

    /// Disconnect every edge, last-connected first. Returns the edges as
    /// `(from, to)` labels in the order they were torn down.
    pub fn disconnect_all(&mut self) -> Vec<(&'static str, &'static str)> {
        let mut order = Vec::with_capacity(self.connected_edges);
        while self.connected_edges > 0 {
            let to = self.connected_edges;
            let from = to - 1;
            let edge = (self.nodes[from].label(), self.nodes[to].label());
            tracing::debug!(from = edge.0, to = edge.1, "capture node disconnected");
            order.push(edge);
            self.connected_edges -= 1;
        }
        order
    }

    pub fn is_connected(&self) -> bool {
        self.connected_edges > 0
    }
}
