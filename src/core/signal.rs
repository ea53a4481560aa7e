#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{MpError, Result};
use crate::tape::InferenceTape;

/// A batch of equally long 1-D signals, row-major `(batch_size, l_signal)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SignalBatch {
    batch_size: usize,
    l_signal: usize,
    data: Vec<f32>,
}

impl SignalBatch {
    /// View `data` as `batch_size` rows. Fails if it does not divide evenly.
    pub fn from_flat(data: Vec<f32>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(MpError::shape("batch size", 1, 0));
        }
        if data.is_empty() {
            return Err(MpError::shape("signal samples", batch_size, 0));
        }
        if data.len() % batch_size != 0 {
            return Err(MpError::shape(
                "signal length divisible by batch size",
                data.len().next_multiple_of(batch_size),
                data.len(),
            ));
        }
        let l_signal = data.len() / batch_size;
        Ok(Self {
            batch_size,
            l_signal,
            data,
        })
    }

    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self> {
        let l_signal = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * l_signal);
        for row in rows {
            let row = row.as_ref();
            if row.len() != l_signal {
                return Err(MpError::shape("signal row length", l_signal, row.len()));
            }
            data.extend_from_slice(row);
        }
        Self::from_flat(data, rows.len())
    }

    /// Promote a single 1-D signal to a batch of one.
    pub fn single(signal: &[f32]) -> Result<Self> {
        Self::from_flat(signal.to_vec(), 1)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn l_signal(&self) -> usize {
        self.l_signal
    }

    pub fn row(&self, b: usize) -> &[f32] {
        &self.data[b * self.l_signal..(b + 1) * self.l_signal]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Each row right-padded with `kernel_size - 1` zeros.
    pub fn padded(&self, kernel_size: usize) -> Padded {
        let width = self.l_signal + kernel_size.saturating_sub(1);
        let mut data = vec![0.0f32; self.batch_size * width];
        for (dst, src) in data
            .chunks_exact_mut(width)
            .zip(self.data.chunks_exact(self.l_signal))
        {
            dst[..self.l_signal].copy_from_slice(src);
        }
        Padded {
            batch_size: self.batch_size,
            width,
            data,
        }
    }
}

impl TryFrom<&[f32]> for SignalBatch {
    type Error = MpError;

    fn try_from(signal: &[f32]) -> Result<Self> {
        Self::single(signal)
    }
}

impl TryFrom<Vec<f32>> for SignalBatch {
    type Error = MpError;

    fn try_from(signal: Vec<f32>) -> Result<Self> {
        Self::from_flat(signal, 1)
    }
}

impl TryFrom<Vec<Vec<f32>>> for SignalBatch {
    type Error = MpError;

    fn try_from(rows: Vec<Vec<f32>>) -> Result<Self> {
        Self::from_rows(&rows)
    }
}

/// Row-major `(batch_size, l_signal + kernel_size - 1)` buffer.
///
/// Used for the residual, the reconstruction and the zero-padded input.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Padded {
    batch_size: usize,
    width: usize,
    data: Vec<f32>,
}

impl Padded {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `l_signal + kernel_size - 1`.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row(&self, b: usize) -> &[f32] {
        &self.data[b * self.width..(b + 1) * self.width]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Elementwise `self - other`.
    pub fn minus(&self, other: &Padded) -> Padded {
        debug_assert_eq!(self.data.len(), other.data.len());
        Padded {
            batch_size: self.batch_size,
            width: self.width,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a - b)
                .collect(),
        }
    }

    /// Sum of squares over all entries.
    pub fn energy(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum()
    }
}

/// One recorded activation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Spike {
    pub sample: usize,
    pub kernel: usize,
    pub time: usize,
    pub amplitude: f32,
}

/// Activation map, row-major `(batch_size, n_kernel, l_signal)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Activations {
    batch_size: usize,
    n_kernel: usize,
    l_signal: usize,
    data: Vec<f32>,
}

impl Activations {
    pub(crate) fn zeros(batch_size: usize, n_kernel: usize, l_signal: usize) -> Self {
        Self {
            batch_size,
            n_kernel,
            l_signal,
            data: vec![0.0; batch_size * n_kernel * l_signal],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn n_kernel(&self) -> usize {
        self.n_kernel
    }

    pub fn l_signal(&self) -> usize {
        self.l_signal
    }

    #[inline]
    pub fn get(&self, sample: usize, kernel: usize, time: usize) -> f32 {
        self.data[(sample * self.n_kernel + kernel) * self.l_signal + time]
    }

    /// All kernels for one sample, `(n_kernel, l_signal)`.
    pub fn sample(&self, b: usize) -> &[f32] {
        let stride = self.n_kernel * self.l_signal;
        &self.data[b * stride..(b + 1) * stride]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Nonzero activations in `(sample, kernel, time)` order.
    pub fn spikes(&self) -> impl Iterator<Item = Spike> + '_ {
        let (n_kernel, l_signal) = (self.n_kernel, self.l_signal);
        self.data
            .iter()
            .enumerate()
            .filter(|(_, a)| **a != 0.0)
            .map(move |(i, &amplitude)| Spike {
                sample: i / (n_kernel * l_signal),
                kernel: (i / l_signal) % n_kernel,
                time: i % l_signal,
                amplitude,
            })
    }

    pub fn nonzero_count(&self) -> usize {
        self.data.iter().filter(|a| **a != 0.0).count()
    }

    /// Mean absolute activation over every entry of the map.
    pub fn mean_abs(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|a| a.abs()).sum::<f32>() / self.data.len() as f32
    }
}

/// Everything `infer` produces besides the activation map.
#[derive(Debug, Clone)]
pub struct InferenceMeta {
    /// Unexplained signal after greedy subtraction.
    pub residual: Padded,
    /// `padded_signal - residual`.
    pub reconstruction: Padded,
    /// Time steps processed; `l_signal` unless stopped early.
    pub steps_completed: usize,
    /// Present when inference ran in differentiable mode.
    pub tape: Option<InferenceTape>,
}
