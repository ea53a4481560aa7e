//! Inner products used for kernel matching.

#[cfg(feature = "simd")]
use wide::f32x4;

use crate::config::ExecutionTier;

pub type DotFn = fn(&[f32], &[f32]) -> f32;

#[inline]
pub fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// f32x4 lanes over the bulk, scalar tail.
#[cfg(feature = "simd")]
pub fn dot_simd(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let bulk = n - n % 4;
    let mut acc = f32x4::ZERO;
    for (ca, cb) in a[..bulk].chunks_exact(4).zip(b[..bulk].chunks_exact(4)) {
        let va = f32x4::from([ca[0], ca[1], ca[2], ca[3]]);
        let vb = f32x4::from([cb[0], cb[1], cb[2], cb[3]]);
        acc += va * vb;
    }
    let lanes = acc.to_array();
    let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);
    for i in bulk..n {
        sum += a[i] * b[i];
    }
    sum
}

/// Pick the inner product for an (already effective) tier.
pub fn dot_for(tier: ExecutionTier) -> DotFn {
    match tier {
        #[cfg(feature = "simd")]
        ExecutionTier::Simd => dot_simd,
        _ => dot_scalar,
    }
}

/// `out[k] = segment · weights[k]` for every row of a row-major bank.
#[inline]
pub fn match_scores(
    segment: &[f32],
    weights: &[f32],
    kernel_size: usize,
    dot: DotFn,
    out: &mut [f32],
) {
    for (score, kernel) in out.iter_mut().zip(weights.chunks_exact(kernel_size)) {
        *score = dot(segment, kernel);
    }
}

/// Index of the largest `|x|`; the lowest index wins ties.
///
/// NaN scores never win. Returns 0 for an empty or all-NaN slice.
#[inline]
pub fn argmax_abs(xs: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_abs = f32::NEG_INFINITY;
    for (i, x) in xs.iter().enumerate() {
        let a = x.abs();
        if a > best_abs {
            best = i;
            best_abs = a;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_abs_prefers_lowest_index_on_ties() {
        assert_eq!(argmax_abs(&[1.0, -3.0, 3.0, 2.0]), 1);
        assert_eq!(argmax_abs(&[0.0, 0.0, 0.0]), 0);
        assert_eq!(argmax_abs(&[f32::NAN, 0.5, -0.5]), 1);
    }

    #[test]
    fn match_scores_covers_every_kernel() {
        let weights = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut out = [0.0; 3];
        match_scores(&[2.0, 3.0], &weights, 2, dot_scalar, &mut out);
        assert_eq!(out, [2.0, 3.0, 5.0]);
    }

    #[cfg(feature = "simd")]
    #[test]
    fn simd_dot_matches_scalar() {
        let a: Vec<f32> = (0..11).map(|i| i as f32 * 0.25 - 1.0).collect();
        let b: Vec<f32> = (0..11).map(|i| 1.0 - i as f32 * 0.1).collect();
        assert!((dot_simd(&a, &b) - dot_scalar(&a, &b)).abs() < 1e-5);
    }
}
