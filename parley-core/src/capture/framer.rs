//! Fixed-size block processor.
//!
//! Input arrives in whatever slice sizes the device (or resampler) produces.
//! The framer regroups it into exactly `block_size` samples, encodes each full
//! block and hands it to the emit callback before `push` returns. A trailing
//! partial block is held until more input arrives.

use crate::buffering::frame::AudioFrame;

pub struct BlockFramer {
    block: Vec<f32>,
    block_size: usize,
    sample_rate: u32,
    next_index: u64,
}

impl BlockFramer {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        let block_size = block_size.max(1);
        Self {
            block: Vec::with_capacity(block_size),
            block_size,
            sample_rate,
            next_index: 0,
        }
    }

    /// Feed samples; `emit` runs once per completed block, in order.
    ///
    /// Returns the number of frames emitted by this call.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(AudioFrame)) -> usize {
        let mut emitted = 0;
        while !samples.is_empty() {
            let take = (self.block_size - self.block.len()).min(samples.len());
            self.block.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.block.len() == self.block_size {
                emit(AudioFrame::encode(&self.block, self.sample_rate, self.next_index));
                self.next_index += 1;
                self.block.clear();
                emitted += 1;
            }
        }
        emitted
    }

    /// Samples waiting for the current block to fill.
    pub fn pending(&self) -> usize {
        self.block.len()
    }

    /// Frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_index
    }

    /// Drop any partial block and restart numbering.
    pub fn reset(&mut self) {
        self.block.clear();
        self.next_index = 0;
    }
}
