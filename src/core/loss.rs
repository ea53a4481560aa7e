#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::signal::{Activations, Padded};

/// Loss strategies a caller applies after inference.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LossKind {
    /// Mean squared error between the padded signal and the reconstruction.
    Reconstruction,
    /// Reconstruction error plus `sparsity_penalty * mean(|acts|)`.
    Composite { sparsity_penalty: f32 },
}

impl LossKind {
    pub fn value(&self, padded: &Padded, reconstruction: &Padded, acts: &Activations) -> f32 {
        let mse = mse(padded.as_slice(), reconstruction.as_slice());
        match *self {
            LossKind::Reconstruction => mse,
            LossKind::Composite { sparsity_penalty } => mse + sparsity_penalty * acts.mean_abs(),
        }
    }

    /// `∂L/∂reconstruction`.
    pub fn grad_reconstruction(&self, padded: &Padded, reconstruction: &Padded) -> Padded {
        let n = padded.as_slice().len().max(1) as f32;
        let mut g = reconstruction.minus(padded);
        for x in g.as_mut_slice() {
            *x *= 2.0 / n;
        }
        g
    }

    /// `∂L/∂acts[i]` for an entry holding `amplitude`, in a map of `acts_len` entries.
    pub fn grad_activation(&self, amplitude: f32, acts_len: usize) -> f32 {
        match *self {
            LossKind::Reconstruction => 0.0,
            LossKind::Composite { sparsity_penalty } => {
                if amplitude == 0.0 {
                    0.0
                } else {
                    sparsity_penalty * amplitude.signum() / acts_len.max(1) as f32
                }
            }
        }
    }
}

fn mse(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        / a.len() as f32
}
