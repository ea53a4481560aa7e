//! Causal greedy matching pursuit.
//!
//! For each time step `tt`, every sample reads the residual window
//! `[tt, tt + kernel_size)`, picks the kernel with the largest `|dot|`,
//! gates the resulting spike, records it, and subtracts its scaled kernel
//! from the residual. Steps run strictly in order because each read depends
//! on the previous step's subtraction. Samples never interact, so the work
//! inside one step may be spread across rows.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::{ExecutionTier, GatingPolicy, GradientFlow, MpConfig, Thresholds};
use crate::dictionary::{Dictionary, KernelBank};
use crate::error::{MpError, Result};
use crate::linalg::{self, DotFn};
use crate::loss::LossKind;
use crate::mask::KernelMasks;
use crate::signal::{Activations, InferenceMeta, Padded, SignalBatch};
use crate::tape::{InferenceTape, StepRecord, TapeRow};

/// Inference engine over a dictionary it holds by composition.
///
/// Masks are derived from the dictionary at construction. After any change
/// to the weights, call [`CausalMp::after_update`] before the next inference;
/// the engine does not detect stale masks.
#[derive(Debug, Clone)]
pub struct CausalMp<D: Dictionary = KernelBank> {
    dict: D,
    cfg: MpConfig,
    thresholds: Thresholds,
    masks: KernelMasks,
}

/// Read-only state shared by every row within one inference call.
#[derive(Clone, Copy)]
struct StepContext<'a> {
    weights: &'a [f32],
    masks: &'a KernelMasks,
    thresholds: Thresholds,
    gating: GatingPolicy,
    n_kernel: usize,
    kernel_size: usize,
    l_signal: usize,
    dot: DotFn,
}

impl<D: Dictionary> CausalMp<D> {
    pub fn new(dict: D, cfg: MpConfig) -> Result<Self> {
        cfg.validate()?;
        check_dictionary(&dict)?;

        let thresholds = cfg.resolve(dict.kernel_size());
        let masks = KernelMasks::build(&dict, thresholds.mask_epsilon);

        let effective = cfg.execution_tier.effective();
        if effective != cfg.execution_tier {
            tracing::warn!(
                requested = ?cfg.execution_tier,
                effective = ?effective,
                "execution tier not compiled in; falling back"
            );
        }

        Ok(Self {
            dict,
            cfg,
            thresholds,
            masks,
        })
    }

    pub fn dictionary(&self) -> &D {
        &self.dict
    }

    /// Mutable access to the dictionary. Call [`Self::after_update`] once done.
    pub fn dictionary_mut(&mut self) -> &mut D {
        &mut self.dict
    }

    pub fn into_dictionary(self) -> D {
        self.dict
    }

    pub fn config(&self) -> &MpConfig {
        &self.cfg
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn masks(&self) -> &KernelMasks {
        &self.masks
    }

    pub fn gradient_flow(&self) -> GradientFlow {
        self.cfg.gradient_flow
    }

    /// Hook for the training loop after each weight update: rebuild masks.
    pub fn after_update(&mut self) {
        self.masks = KernelMasks::build(&self.dict, self.thresholds.mask_epsilon);
    }

    /// Mutate a copy of the dictionary, then commit it and rebuild masks.
    ///
    /// The kernel geometry must not change. On error the engine keeps its
    /// previous dictionary and masks.
    pub fn update_dictionary<F>(&mut self, f: F) -> Result<()>
    where
        D: Clone,
        F: FnOnce(&mut D),
    {
        let mut next = self.dict.clone();
        f(&mut next);
        check_dictionary(&next)?;
        if next.n_kernel() != self.dict.n_kernel() {
            return Err(MpError::shape(
                "n_kernel after update",
                self.dict.n_kernel(),
                next.n_kernel(),
            ));
        }
        if next.kernel_size() != self.dict.kernel_size() {
            return Err(MpError::shape(
                "kernel_size after update",
                self.dict.kernel_size(),
                next.kernel_size(),
            ));
        }
        self.dict = next;
        self.after_update();
        Ok(())
    }

    /// Decompose every row of `signal`.
    ///
    /// Returns the `(batch_size, n_kernel, l_signal)` activation map and the
    /// residual/reconstruction pair, both `l_signal + kernel_size - 1` wide.
    pub fn infer(&self, signal: &SignalBatch) -> Result<(Activations, InferenceMeta)> {
        self.infer_until(signal, |_| true)
    }

    /// [`Self::infer`] on a flat buffer viewed as `batch_size` rows.
    pub fn infer_flat(
        &self,
        data: &[f32],
        batch_size: usize,
    ) -> Result<(Activations, InferenceMeta)> {
        let signal = SignalBatch::from_flat(data.to_vec(), batch_size)?;
        self.infer(&signal)
    }

    /// Like [`Self::infer`], but asks `keep_going(tt)` before each step.
    ///
    /// Stopping early leaves a consistent partial result: every completed
    /// step has already updated both the residual and the activation map.
    pub fn infer_until<F>(
        &self,
        signal: &SignalBatch,
        mut keep_going: F,
    ) -> Result<(Activations, InferenceMeta)>
    where
        F: FnMut(usize) -> bool,
    {
        let batch_size = signal.batch_size();
        let l_signal = signal.l_signal();
        let n_kernel = self.dict.n_kernel();
        let kernel_size = self.dict.kernel_size();

        let _span = tracing::debug_span!("infer", batch_size, l_signal).entered();

        let tier = self.cfg.execution_tier.effective();
        let ctx = StepContext {
            weights: self.dict.weights(),
            masks: &self.masks,
            thresholds: self.thresholds,
            gating: self.cfg.gating,
            n_kernel,
            kernel_size,
            l_signal,
            dot: linalg::dot_for(tier),
        };

        let padded = signal.padded(kernel_size);
        let mut residual = padded.clone();
        let mut acts = Activations::zeros(batch_size, n_kernel, l_signal);
        let mut tape = match self.cfg.gradient_flow {
            GradientFlow::Differentiable => Some(InferenceTape::new(
                batch_size,
                l_signal,
                n_kernel,
                kernel_size,
            )),
            GradientFlow::Detached => None,
        };

        let mut steps_completed = 0;
        {
            let mut slots: Vec<Option<&mut TapeRow>> = match tape.as_mut() {
                Some(t) => t.rows_mut().iter_mut().map(Some).collect(),
                None => (0..batch_size).map(|_| None).collect(),
            };

            for tt in 0..l_signal {
                if !keep_going(tt) {
                    tracing::debug!(tt, "inference stopped by caller");
                    break;
                }
                match tier {
                    ExecutionTier::Parallel => {
                        step_parallel(&ctx, tt, &mut residual, &mut acts, &mut slots)
                    }
                    ExecutionTier::Scalar | ExecutionTier::Simd => {
                        step_rows(&ctx, tt, &mut residual, &mut acts, &mut slots)
                    }
                }
                steps_completed += 1;
            }
        }

        let reconstruction = padded.minus(&residual);

        tracing::debug!(
            steps_completed,
            spikes = acts.nonzero_count(),
            residual_energy = residual.energy(),
            "inference finished"
        );

        Ok((
            acts,
            InferenceMeta {
                residual,
                reconstruction,
                steps_completed,
                tape,
            },
        ))
    }

    /// The loss matching the configured gradient flow.
    ///
    /// Differentiable runs use the composite loss (reconstruction error plus
    /// sparsity penalty); detached runs use plain reconstruction error.
    pub fn loss_kind(&self) -> LossKind {
        match self.cfg.gradient_flow {
            GradientFlow::Differentiable => LossKind::Composite {
                sparsity_penalty: self.cfg.sparsity_penalty,
            },
            GradientFlow::Detached => LossKind::Reconstruction,
        }
    }

    pub fn loss(
        &self,
        signal: &SignalBatch,
        reconstruction: &Padded,
        acts: &Activations,
    ) -> Result<f32> {
        let padded = self.check_outputs(signal, reconstruction, acts)?;
        Ok(self.loss_kind().value(&padded, reconstruction, acts))
    }

    /// `∂loss/∂weights` (`n_kernel × kernel_size`) for a differentiable run.
    ///
    /// The weights must not have changed since `meta` was produced.
    pub fn weight_gradient(
        &self,
        signal: &SignalBatch,
        acts: &Activations,
        meta: &InferenceMeta,
    ) -> Result<Vec<f32>> {
        let tape = meta.tape.as_ref().ok_or(MpError::NotDifferentiable)?;
        let padded = self.check_outputs(signal, &meta.reconstruction, acts)?;

        let kind = self.loss_kind();
        let g_recon = kind.grad_reconstruction(&padded, &meta.reconstruction);
        let acts_len = acts.as_slice().len();
        Ok(tape.backward(self.dict.weights(), &g_recon, |a| {
            kind.grad_activation(a, acts_len)
        }))
    }

    fn check_outputs(
        &self,
        signal: &SignalBatch,
        reconstruction: &Padded,
        acts: &Activations,
    ) -> Result<Padded> {
        let padded = signal.padded(self.dict.kernel_size());
        if reconstruction.batch_size() != padded.batch_size() {
            return Err(MpError::shape(
                "reconstruction batch size",
                padded.batch_size(),
                reconstruction.batch_size(),
            ));
        }
        if reconstruction.width() != padded.width() {
            return Err(MpError::shape(
                "reconstruction width",
                padded.width(),
                reconstruction.width(),
            ));
        }
        let expected_acts = signal.batch_size() * self.dict.n_kernel() * signal.l_signal();
        if acts.as_slice().len() != expected_acts {
            return Err(MpError::shape(
                "activation map size",
                expected_acts,
                acts.as_slice().len(),
            ));
        }
        Ok(padded)
    }
}

fn check_dictionary<D: Dictionary + ?Sized>(dict: &D) -> Result<()> {
    if dict.n_kernel() == 0 {
        return Err(MpError::InvalidDictionary("n_kernel must be >= 1"));
    }
    if dict.kernel_size() == 0 {
        return Err(MpError::InvalidDictionary("kernel_size must be >= 1"));
    }
    let expected = dict.n_kernel() * dict.kernel_size();
    if dict.weights().len() != expected {
        return Err(MpError::shape(
            "dictionary weights",
            expected,
            dict.weights().len(),
        ));
    }
    Ok(())
}

fn step_rows(
    ctx: &StepContext<'_>,
    tt: usize,
    residual: &mut Padded,
    acts: &mut Activations,
    slots: &mut [Option<&mut TapeRow>],
) {
    let width = residual.width();
    let stride = ctx.n_kernel * ctx.l_signal;
    let mut scores = vec![0.0f32; ctx.n_kernel];

    for ((resid_row, acts_row), slot) in residual
        .as_mut_slice()
        .chunks_exact_mut(width)
        .zip(acts.as_mut_slice().chunks_exact_mut(stride))
        .zip(slots.iter_mut())
    {
        step_row(ctx, tt, resid_row, acts_row, slot.as_deref_mut(), &mut scores);
    }
}

#[cfg(feature = "parallel")]
fn step_parallel(
    ctx: &StepContext<'_>,
    tt: usize,
    residual: &mut Padded,
    acts: &mut Activations,
    slots: &mut [Option<&mut TapeRow>],
) {
    let width = residual.width();
    let stride = ctx.n_kernel * ctx.l_signal;

    residual
        .as_mut_slice()
        .par_chunks_exact_mut(width)
        .zip(acts.as_mut_slice().par_chunks_exact_mut(stride))
        .zip(slots.par_iter_mut())
        .for_each_init(
            || vec![0.0f32; ctx.n_kernel],
            |scores, ((resid_row, acts_row), slot)| {
                step_row(ctx, tt, resid_row, acts_row, slot.as_deref_mut(), scores);
            },
        );
}

#[cfg(not(feature = "parallel"))]
fn step_parallel(
    ctx: &StepContext<'_>,
    tt: usize,
    residual: &mut Padded,
    acts: &mut Activations,
    slots: &mut [Option<&mut TapeRow>],
) {
    step_rows(ctx, tt, residual, acts, slots)
}

/// One time step for one sample.
fn step_row(
    ctx: &StepContext<'_>,
    tt: usize,
    resid_row: &mut [f32],
    acts_row: &mut [f32],
    tape: Option<&mut TapeRow>,
    scores: &mut [f32],
) {
    let ks = ctx.kernel_size;
    let segment = &resid_row[tt..tt + ks];

    linalg::match_scores(segment, ctx.weights, ks, ctx.dot, scores);
    let k = linalg::argmax_abs(scores);
    let candidate = scores[k];
    let fired = passes_gate(ctx, k, candidate, segment);
    // Gated-out spikes are written as an exact zero, never skipped.
    let spike = if fired { candidate } else { 0.0 };

    if let Some(row) = tape {
        row.push(
            StepRecord {
                kernel: k,
                spike,
                fired,
            },
            segment,
        );
    }

    acts_row[k * ctx.l_signal + tt] = spike;

    let kernel = &ctx.weights[k * ks..(k + 1) * ks];
    for (r, w) in resid_row[tt..tt + ks].iter_mut().zip(kernel) {
        *r -= spike * w;
    }
}

fn passes_gate(ctx: &StepContext<'_>, k: usize, spike: f32, segment: &[f32]) -> bool {
    let abs_spike = spike.abs();
    let raw = abs_spike > ctx.thresholds.thresh;
    match ctx.gating {
        GatingPolicy::RawOnly => raw,
        GatingPolicy::Normalized => {
            // A silent masked window never fires.
            let norm = ctx.masks.masked_norm(k, segment);
            raw && norm > 0.0 && abs_spike / norm > ctx.thresholds.normed_thresh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rows: &[&[f32]], cfg: MpConfig) -> CausalMp {
        CausalMp::new(KernelBank::from_rows(rows).unwrap(), cfg).unwrap()
    }

    fn scenario_config() -> MpConfig {
        MpConfig::default()
            .with_mask_epsilon(0.5)
            .with_thresh(0.05)
            .with_normed_thresh(0.0)
    }

    #[test]
    fn first_step_fires_dot_product_of_window() {
        let mp = engine(&[&[0.0, 1.0, 1.0]], scenario_config());
        assert_eq!(mp.masks().row(0), &[0.0, 1.0, 1.0]);

        let signal = SignalBatch::single(&[0.0, 2.0, 2.0, 0.0, 0.0]).unwrap();
        let (acts, meta) = mp.infer_until(&signal, |tt| tt < 1).unwrap();
        assert_eq!(meta.steps_completed, 1);
        assert_eq!(acts.get(0, 0, 0), 4.0);
        // Window [0, 2, 2] minus 4 * [0, 1, 1].
        assert_eq!(&meta.residual.row(0)[..3], &[0.0, -2.0, -2.0]);
    }

    #[test]
    fn unit_norm_kernel_explains_matching_window_exactly() {
        let h = core::f32::consts::FRAC_1_SQRT_2;
        let mp = engine(&[&[0.0, h, h]], scenario_config());
        let signal = SignalBatch::single(&[0.0, 2.0, 2.0, 0.0, 0.0]).unwrap();
        let (acts, meta) = mp.infer(&signal).unwrap();

        assert!((acts.get(0, 0, 0) - 2.0 * 2.0 * h).abs() < 1e-5);
        assert!(meta.residual.row(0).iter().all(|r| r.abs() < 1e-5));
        assert_eq!(acts.nonzero_count(), 1);
    }

    #[test]
    fn gated_out_spikes_leave_residual_untouched() {
        let mp = engine(&[&[1.0, 0.0]], MpConfig::default().with_thresh(10.0));
        let signal = SignalBatch::single(&[1.0, -2.0, 3.0]).unwrap();
        let (acts, meta) = mp.infer(&signal).unwrap();
        assert_eq!(acts.nonzero_count(), 0);
        assert_eq!(meta.residual, signal.padded(2));
        assert!(meta.reconstruction.as_slice().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn silent_masked_window_never_fires() {
        // Support starts at position 1; the signal only has energy at position 0
        // of each window, so the masked norm is zero at tt = 0.
        let mp = engine(
            &[&[1.0, 1.0]],
            MpConfig::default()
                .with_mask_epsilon(5.0)
                .with_thresh(0.0)
                .with_normed_thresh(0.0),
        );
        // mask_epsilon above every weight: all-ones fallback.
        assert_eq!(mp.masks().row(0), &[1.0, 1.0]);

        let mp = engine(
            &[&[0.1, 1.0]],
            MpConfig::default()
                .with_mask_epsilon(0.5)
                .with_thresh(0.0)
                .with_normed_thresh(0.0),
        );
        assert_eq!(mp.masks().row(0), &[0.0, 1.0]);
        let signal = SignalBatch::single(&[3.0]).unwrap();
        let (acts, meta) = mp.infer(&signal).unwrap();
        // dot = 0.3 but window [3, 0] has no energy under the mask.
        assert_eq!(acts.get(0, 0, 0), 0.0);
        assert!(acts.as_slice().iter().all(|a| a.is_finite()));
        assert_eq!(meta.residual.row(0), &[3.0, 0.0]);
    }

    #[test]
    fn raw_only_gating_ignores_normalized_condition() {
        let cfg = MpConfig::default()
            .with_thresh(0.05)
            .with_normed_thresh(100.0)
            .with_mask_epsilon(0.5);
        let signal = SignalBatch::single(&[1.0, 0.0, 0.0]).unwrap();

        let normalized = engine(&[&[1.0]], cfg);
        let (acts, _) = normalized.infer(&signal).unwrap();
        assert_eq!(acts.nonzero_count(), 0);

        let raw = engine(&[&[1.0]], cfg.with_gating(GatingPolicy::RawOnly));
        let (acts, _) = raw.infer(&signal).unwrap();
        assert_eq!(acts.get(0, 0, 0), 1.0);
    }

    #[test]
    fn ties_go_to_lowest_kernel_index() {
        let mp = engine(
            &[&[1.0], &[-1.0], &[1.0]],
            MpConfig::default().with_gating(GatingPolicy::RawOnly),
        );
        let (acts, _) = mp.infer(&SignalBatch::single(&[2.0]).unwrap()).unwrap();
        assert_eq!(acts.get(0, 0, 0), 2.0);
        assert_eq!(acts.get(0, 1, 0), 0.0);
        assert_eq!(acts.get(0, 2, 0), 0.0);
    }

    #[test]
    fn negative_match_records_signed_spike() {
        let mp = engine(
            &[&[1.0, 0.0], &[0.0, 1.0]],
            MpConfig::default().with_gating(GatingPolicy::RawOnly),
        );
        let signal = SignalBatch::single(&[-3.0, 0.0]).unwrap();
        let (acts, meta) = mp.infer(&signal).unwrap();
        assert_eq!(acts.get(0, 0, 0), -3.0);
        assert_eq!(meta.residual.row(0), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn detached_runs_record_no_tape() {
        let cfg = MpConfig::default().with_gradient_flow(GradientFlow::Detached);
        let mp = engine(&[&[1.0, 0.5]], cfg);
        let signal = SignalBatch::single(&[1.0, 1.0, 1.0]).unwrap();
        let (acts, meta) = mp.infer(&signal).unwrap();
        assert!(meta.tape.is_none());
        assert!(matches!(
            mp.weight_gradient(&signal, &acts, &meta),
            Err(MpError::NotDifferentiable)
        ));
        assert_eq!(mp.loss_kind(), LossKind::Reconstruction);
    }

    #[test]
    fn tape_records_pre_subtraction_segments() {
        let mp = engine(
            &[&[1.0, 1.0]],
            MpConfig::default().with_gating(GatingPolicy::RawOnly),
        );
        let signal = SignalBatch::single(&[1.0, 2.0, 0.0]).unwrap();
        let (_, meta) = mp.infer(&signal).unwrap();
        let tape = meta.tape.unwrap();
        assert_eq!(tape.steps(), 3);
        assert_eq!(tape.segment(0, 0), &[1.0, 2.0]);
        assert_eq!(
            *tape.record(0, 0),
            StepRecord {
                kernel: 0,
                spike: 3.0,
                fired: true
            }
        );
        // After subtracting 3 * [1, 1] the residual is [-2, -1, 0, 0].
        assert_eq!(tape.segment(0, 1), &[-1.0, 0.0]);
    }

    #[test]
    fn after_update_rebuilds_masks() {
        let mut mp = engine(&[&[0.0, 0.0, 1.0]], scenario_config());
        assert_eq!(mp.masks().row(0), &[0.0, 0.0, 1.0]);

        mp.dictionary_mut().set_kernel(0, &[1.0, 0.0, 0.0]).unwrap();
        // Stale until the hook runs.
        assert_eq!(mp.masks().row(0), &[0.0, 0.0, 1.0]);
        mp.after_update();
        assert_eq!(mp.masks().row(0), &[1.0, 1.0, 1.0]);

        mp.update_dictionary(|d| d.set_kernel(0, &[0.0, 0.9, 0.0]).unwrap())
            .unwrap();
        assert_eq!(mp.masks().row(0), &[0.0, 1.0, 1.0]);
    }

    #[derive(Debug, Clone)]
    struct GrowableDict {
        kernel_size: usize,
        weights: Vec<f32>,
    }

    impl Dictionary for GrowableDict {
        fn n_kernel(&self) -> usize {
            self.weights.len() / self.kernel_size
        }

        fn kernel_size(&self) -> usize {
            self.kernel_size
        }

        fn weights(&self) -> &[f32] {
            &self.weights
        }
    }

    #[test]
    fn failed_update_keeps_previous_dictionary() {
        let dict = GrowableDict {
            kernel_size: 2,
            weights: vec![1.0, 0.5],
        };
        let mut mp = CausalMp::new(dict, scenario_config()).unwrap();
        let signal = SignalBatch::single(&[1.0, 2.0, 0.0]).unwrap();
        let (before, _) = mp.infer(&signal).unwrap();

        let err = mp.update_dictionary(|d| d.weights.extend_from_slice(&[0.0, 1.0]));
        assert!(matches!(err, Err(MpError::ShapeMismatch { .. })));
        assert_eq!(mp.dictionary().n_kernel(), 1);
        assert_eq!(mp.dictionary().weights(), &[1.0, 0.5]);
        assert_eq!(mp.masks().n_kernel(), 1);

        let (after, _) = mp.infer(&signal).unwrap();
        assert_eq!(before, after);

        let err = mp.update_dictionary(|d| {
            d.weights.pop();
        });
        assert!(matches!(err, Err(MpError::InvalidDictionary(_))));
        assert_eq!(mp.dictionary().weights(), &[1.0, 0.5]);
    }

    #[test]
    fn infer_flat_reports_shape_mismatch() {
        let mp = engine(&[&[1.0]], MpConfig::default());
        assert!(matches!(
            mp.infer_flat(&[1.0, 2.0, 3.0], 2),
            Err(MpError::ShapeMismatch { .. })
        ));
        let (acts, _) = mp.infer_flat(&[1.0, 2.0, 3.0, 4.0], 2).unwrap();
        assert_eq!(acts.batch_size(), 2);
        assert_eq!(acts.l_signal(), 2);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let bank = KernelBank::from_rows(&[[1.0]]).unwrap();
        assert!(matches!(
            CausalMp::new(bank, MpConfig::default().with_thresh(f32::NAN)),
            Err(MpError::InvalidConfig(_))
        ));
    }

    #[test]
    fn loss_checks_output_shapes() {
        let mp = engine(&[&[1.0, 0.0]], MpConfig::default());
        let signal = SignalBatch::single(&[1.0, 0.0, 0.0]).unwrap();
        let (acts, meta) = mp.infer(&signal).unwrap();
        assert!(mp.loss(&signal, &meta.reconstruction, &acts).is_ok());

        let other = SignalBatch::single(&[1.0, 0.0]).unwrap();
        assert!(matches!(
            mp.loss(&other, &meta.reconstruction, &acts),
            Err(MpError::ShapeMismatch { .. })
        ));
    }
}
