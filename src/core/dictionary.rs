use std::io::{self, Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{MpError, Result};
use crate::prng::Prng;
use crate::storage;

/// Read-only view of a bank of equally sized causal kernels.
///
/// Weights are stored row-major as `n_kernel × kernel_size`. The inference
/// engine holds a `Dictionary` by composition and never mutates it itself.
pub trait Dictionary {
    fn n_kernel(&self) -> usize;

    fn kernel_size(&self) -> usize;

    /// Flattened `n_kernel × kernel_size` weights.
    fn weights(&self) -> &[f32];

    fn kernel(&self, k: usize) -> &[f32] {
        let ks = self.kernel_size();
        &self.weights()[k * ks..(k + 1) * ks]
    }
}

impl<D: Dictionary + ?Sized> Dictionary for &D {
    fn n_kernel(&self) -> usize {
        (**self).n_kernel()
    }

    fn kernel_size(&self) -> usize {
        (**self).kernel_size()
    }

    fn weights(&self) -> &[f32] {
        (**self).weights()
    }
}

/// Owned dictionary of `n_kernel` filters of length `kernel_size`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelBank {
    n_kernel: usize,
    kernel_size: usize,
    weights: Vec<f32>,
}

const KERN_TAG: [u8; 4] = *b"KERN";

impl KernelBank {
    /// Build from a flat row-major buffer.
    pub fn from_flat(n_kernel: usize, kernel_size: usize, weights: Vec<f32>) -> Result<Self> {
        if n_kernel == 0 {
            return Err(MpError::InvalidDictionary("n_kernel must be >= 1"));
        }
        if kernel_size == 0 {
            return Err(MpError::InvalidDictionary("kernel_size must be >= 1"));
        }
        let expected = n_kernel * kernel_size;
        if weights.len() != expected {
            return Err(MpError::shape("dictionary weights", expected, weights.len()));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(MpError::InvalidDictionary("weights must be finite"));
        }
        Ok(Self {
            n_kernel,
            kernel_size,
            weights,
        })
    }

    /// Build from one slice per kernel; all rows must share a length.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self> {
        let kernel_size = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut weights = Vec::with_capacity(rows.len() * kernel_size);
        for row in rows {
            let row = row.as_ref();
            if row.len() != kernel_size {
                return Err(MpError::shape("kernel row length", kernel_size, row.len()));
            }
            weights.extend_from_slice(row);
        }
        Self::from_flat(rows.len(), kernel_size, weights)
    }

    /// Gaussian-initialised kernels with unit L2 norm, reproducible from `seed`.
    pub fn random(n_kernel: usize, kernel_size: usize, seed: u64) -> Result<Self> {
        let mut weights = vec![0.0f32; n_kernel * kernel_size];
        Prng::new(seed).fill_normal(&mut weights);
        let mut bank = Self::from_flat(n_kernel, kernel_size, weights)?;
        bank.normalize_rows();
        Ok(bank)
    }

    /// Scale each kernel to unit L2 norm. All-zero kernels are left untouched.
    pub fn normalize_rows(&mut self) {
        for row in self.weights.chunks_exact_mut(self.kernel_size) {
            let norm = row.iter().map(|w| w * w).sum::<f32>().sqrt();
            if norm > 0.0 {
                for w in row {
                    *w /= norm;
                }
            }
        }
    }

    /// Mutable access to the flat weights.
    ///
    /// Any engine holding this bank must have `after_update` called before the
    /// next inference.
    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn set_kernel(&mut self, k: usize, values: &[f32]) -> Result<()> {
        if k >= self.n_kernel {
            return Err(MpError::shape("kernel index bound", self.n_kernel, k));
        }
        if values.len() != self.kernel_size {
            return Err(MpError::shape("kernel row length", self.kernel_size, values.len()));
        }
        let ks = self.kernel_size;
        self.weights[k * ks..(k + 1) * ks].copy_from_slice(values);
        Ok(())
    }

    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        let mut payload = Vec::with_capacity(8 + 4 * self.weights.len());
        storage::write_u32_le(&mut payload, self.n_kernel as u32)?;
        storage::write_u32_le(&mut payload, self.kernel_size as u32)?;
        for &x in &self.weights {
            storage::write_f32_le(&mut payload, x)?;
        }
        storage::write_chunk_lz4(w, KERN_TAG, &payload)
    }

    pub fn load_image_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = storage::read_exact::<8, _>(r)?;
        if &magic != storage::MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a dictionary image",
            ));
        }
        let version = storage::read_u32_le(r)?;
        if version != storage::VERSION_V1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported dictionary image version {version}"),
            ));
        }

        loop {
            let (tag, len) = storage::read_chunk_header(r)?;
            if tag != KERN_TAG {
                storage::skip_chunk(r, len)?;
                continue;
            }

            let payload = storage::read_chunk_lz4_body(r, len)?;
            let mut p = payload.as_slice();
            let n_kernel = storage::read_u32_le(&mut p)? as usize;
            let kernel_size = storage::read_u32_le(&mut p)? as usize;
            let count = n_kernel.checked_mul(kernel_size).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "kernel shape overflows")
            })?;
            if p.len() != count * 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "kernel payload length does not match its shape",
                ));
            }
            let mut weights = Vec::with_capacity(count);
            for _ in 0..count {
                weights.push(storage::read_f32_le(&mut p)?);
            }
            return Self::from_flat(n_kernel, kernel_size, weights)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
        }
    }

    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut w = storage::CountingWriter::new();
        self.save_image_to(&mut w)?;
        Ok(w.written())
    }

    pub fn save_image_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.image_size_bytes()?);
        self.save_image_to(&mut out)?;
        Ok(out)
    }

    pub fn load_image_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut r = bytes;
        Self::load_image_from(&mut r)
    }
}

impl Dictionary for KernelBank {
    fn n_kernel(&self) -> usize {
        self.n_kernel
    }

    fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    fn weights(&self) -> &[f32] {
        &self.weights
    }
}
