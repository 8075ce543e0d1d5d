//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Input devices run at their native rate (commonly 44.1 or 48 kHz) while
//! capture frames must leave at the configured capture rate. `RateConverter`
//! bridges that gap on the capture worker, where allocation is allowed.
//!
//! When the rates already match it is a passthrough and no rubato session is
//! created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{ParleyError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    pending: Vec<f32>,
    /// Input frames rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
    input_rate: u32,
    output_rate: u32,
}

impl RateConverter {
    /// Create a converter from `input_rate` to `output_rate` consuming
    /// `chunk_size` input frames per rubato call.
    ///
    /// # Errors
    /// `ParleyError::AudioStream` if rubato rejects the ratio or chunk size.
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                scratch: Vec::new(),
                input_rate,
                output_rate,
            });
        }

        let ratio = output_rate as f64 / input_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| ParleyError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        info!(input_rate, output_rate, chunk_size, max_out, "capture resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            scratch: vec![vec![0f32; max_out]; 1],
            input_rate,
            output_rate,
        })
    }

    /// Convert `samples`, appending whatever output is ready to `out`.
    ///
    /// Input is held back until a full `chunk_size` block is available, so a
    /// call may append nothing.
    pub fn process_into(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let Some(ref mut resampler) = self.resampler else {
            out.extend_from_slice(samples);
            return;
        };

        self.pending.extend_from_slice(samples);

        let mut consumed_total = 0;
        while self.pending.len() - consumed_total >= self.chunk_size {
            let block = &self.pending[consumed_total..consumed_total + self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.scratch, None) {
                Ok((_consumed, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed_total += self.chunk_size;
        }
        self.pending.drain(..consumed_total);
    }

    /// Convenience wrapper around [`process_into`](Self::process_into).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        self.process_into(samples, &mut out);
        out
    }

    /// Returns `true` when no resampling occurs.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}
