//! Per-kernel support masks.
//!
//! A causal kernel is assumed to have one contiguous region of significant
//! support that starts at an onset and runs to the kernel's end. The mask is
//! zero before the onset and one from the onset onwards. It restricts the
//! segment norm used by the normalized threshold to the kernel's support.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;

/// `n_kernel` binary rows of length `kernel_size`, stored as `0.0`/`1.0`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelMasks {
    n_kernel: usize,
    kernel_size: usize,
    /// First position of each kernel whose weight exceeds the epsilon.
    onsets: Vec<usize>,
    values: Vec<f32>,
}

impl KernelMasks {
    /// Build masks from the current dictionary weights.
    ///
    /// The onset is the first position with `w > mask_epsilon`. When no
    /// position qualifies the onset is 0 and the mask is all ones: the first
    /// maximum of an all-false row is its first element.
    pub fn build<D: Dictionary + ?Sized>(dict: &D, mask_epsilon: f32) -> Self {
        let n_kernel = dict.n_kernel();
        let kernel_size = dict.kernel_size();
        let mut onsets = Vec::with_capacity(n_kernel);
        let mut values = vec![0.0f32; n_kernel * kernel_size];
        let mut degenerate = 0usize;

        for (k, row) in values.chunks_exact_mut(kernel_size).enumerate() {
            let onset = match dict.kernel(k).iter().position(|&w| w > mask_epsilon) {
                Some(i) => i,
                None => {
                    degenerate += 1;
                    0
                }
            };
            row[onset..].fill(1.0);
            onsets.push(onset);
        }

        if degenerate > 0 {
            tracing::trace!(
                degenerate,
                mask_epsilon,
                "kernels without support above epsilon fall back to all-ones masks"
            );
        }

        Self {
            n_kernel,
            kernel_size,
            onsets,
            values,
        }
    }

    pub fn n_kernel(&self) -> usize {
        self.n_kernel
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    #[inline]
    pub fn row(&self, k: usize) -> &[f32] {
        &self.values[k * self.kernel_size..(k + 1) * self.kernel_size]
    }

    #[inline]
    pub fn onset(&self, k: usize) -> usize {
        self.onsets[k]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// L2 norm of `segment ⊙ mask[k]`.
    ///
    /// The mask is a suffix of ones, so this is the norm of the segment tail.
    #[inline]
    pub fn masked_norm(&self, k: usize, segment: &[f32]) -> f32 {
        segment[self.onsets[k]..]
            .iter()
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt()
    }
}
