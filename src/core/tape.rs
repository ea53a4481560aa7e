//! Record of inference decisions for differentiable mode.
//!
//! Each step stores a detached copy of the segment it read. Backward passes
//! treat the chosen kernel and the gate as constants and let gradient reach
//! the weights along two paths only:
//! - the step's own subtraction, `X[t..t+K] += spike * w[k]`
//! - the spike itself, `spike = gate * (segment · w[k])`
//!
//! Gradient never flows into earlier residual states.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::signal::Padded;

/// Decision taken for one sample at one time step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepRecord {
    /// Winning kernel.
    pub kernel: usize,
    /// Recorded activation; exactly `0.0` when gated out.
    pub spike: f32,
    pub fired: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TapeRow {
    records: Vec<StepRecord>,
    segments: Vec<f32>,
}

impl TapeRow {
    pub(crate) fn push(&mut self, record: StepRecord, segment: &[f32]) {
        self.records.push(record);
        self.segments.extend_from_slice(segment);
    }
}

#[derive(Debug, Clone)]
pub struct InferenceTape {
    n_kernel: usize,
    kernel_size: usize,
    rows: Vec<TapeRow>,
}

impl InferenceTape {
    pub(crate) fn new(
        batch_size: usize,
        l_signal: usize,
        n_kernel: usize,
        kernel_size: usize,
    ) -> Self {
        let rows = (0..batch_size)
            .map(|_| TapeRow {
                records: Vec::with_capacity(l_signal),
                segments: Vec::with_capacity(l_signal * kernel_size),
            })
            .collect();
        Self {
            n_kernel,
            kernel_size,
            rows,
        }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [TapeRow] {
        &mut self.rows
    }

    pub fn batch_size(&self) -> usize {
        self.rows.len()
    }

    /// Number of recorded time steps.
    pub fn steps(&self) -> usize {
        self.rows.first().map(|r| r.records.len()).unwrap_or(0)
    }

    pub fn record(&self, sample: usize, time: usize) -> &StepRecord {
        &self.rows[sample].records[time]
    }

    /// Residual window `[time, time + kernel_size)` as it stood before the step.
    pub fn segment(&self, sample: usize, time: usize) -> &[f32] {
        let ks = self.kernel_size;
        &self.rows[sample].segments[time * ks..(time + 1) * ks]
    }

    /// Vector-Jacobian product into the flattened weights.
    ///
    /// `grad_reconstruction` is `∂L/∂reconstruction`; `grad_spike` returns the
    /// direct `∂L/∂acts` entry for a recorded spike (0 for losses that ignore
    /// activations). Returns `∂L/∂weights`, `n_kernel × kernel_size`.
    pub fn backward<G>(
        &self,
        weights: &[f32],
        grad_reconstruction: &Padded,
        grad_spike: G,
    ) -> Vec<f32>
    where
        G: Fn(f32) -> f32,
    {
        let ks = self.kernel_size;
        let mut grad = vec![0.0f32; self.n_kernel * ks];

        for (b, row) in self.rows.iter().enumerate() {
            let g_x = grad_reconstruction.row(b);
            for (tt, rec) in row.records.iter().enumerate() {
                if !rec.fired {
                    continue;
                }
                let k = rec.kernel;
                let kernel = &weights[k * ks..(k + 1) * ks];
                let g_window = &g_x[tt..tt + ks];
                let segment = &row.segments[tt * ks..(tt + 1) * ks];

                let g_spike = g_window
                    .iter()
                    .zip(kernel)
                    .map(|(g, w)| g * w)
                    .sum::<f32>()
                    + grad_spike(rec.spike);

                let g_kernel = &mut grad[k * ks..(k + 1) * ks];
                for (gk, (gw, x)) in g_kernel.iter_mut().zip(g_window.iter().zip(segment)) {
                    *gk += rec.spike * gw + g_spike * x;
                }
            }
        }

        grad
    }
}
