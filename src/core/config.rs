#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{MpError, Result};

/// Execution tier for the per-step batch/kernel work.
///
/// Time steps always run in order; tiers only change how the work inside one
/// step is carried out:
/// - `Scalar`: plain loops (baseline, works everywhere)
/// - `Simd`: `wide` f32x4 inner products (requires `simd` feature)
/// - `Parallel`: batch rows spread across rayon workers (requires `parallel` feature)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Simd,
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, given the compiled features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Simd => {
                #[cfg(feature = "simd")]
                {
                    ExecutionTier::Simd
                }
                #[cfg(not(feature = "simd"))]
                {
                    ExecutionTier::Scalar
                }
            }
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }
}

/// Whether inference participates in differentiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GradientFlow {
    /// Record a tape so a loss can be back-propagated into the weights.
    /// Segment reads are still detached from the residual's history.
    #[default]
    Differentiable,
    /// No tape; weights are treated as constants. The dictionary is expected
    /// to be updated by a rule that does not look through inference.
    Detached,
}

/// Which conditions a candidate spike must clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GatingPolicy {
    /// `|spike| > thresh` and `|spike| / ‖segment ⊙ mask‖ > normed_thresh`.
    #[default]
    Normalized,
    /// `|spike| > thresh` only.
    RawOnly,
}

/// Inference settings; missing JSON fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MpConfig {
    /// Raw amplitude threshold.
    pub thresh: f32,

    /// Unitless threshold on `|spike| / masked segment norm`.
    /// `None` resolves to `2 / sqrt(kernel_size)`.
    pub normed_thresh: Option<f32>,

    /// Weight cutoff for kernel support masks.
    /// `None` (or `0.0`) resolves to `0.01 * sqrt(1 / kernel_size)`.
    pub mask_epsilon: Option<f32>,

    pub gradient_flow: GradientFlow,

    pub gating: GatingPolicy,

    /// Weight of the mean |activation| term in the composite loss.
    pub sparsity_penalty: f32,

    pub execution_tier: ExecutionTier,
}

impl Default for MpConfig {
    fn default() -> Self {
        Self {
            thresh: 0.1,
            normed_thresh: None,
            mask_epsilon: None,
            gradient_flow: GradientFlow::Differentiable,
            gating: GatingPolicy::Normalized,
            sparsity_penalty: 0.01,
            execution_tier: ExecutionTier::Scalar,
        }
    }
}

/// Concrete thresholds for one kernel size.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Thresholds {
    pub thresh: f32,
    pub normed_thresh: f32,
    pub mask_epsilon: f32,
}

impl MpConfig {
    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> Result<()> {
        if !self.thresh.is_finite() || self.thresh < 0.0 {
            return Err(MpError::InvalidConfig("thresh must be finite and >= 0"));
        }
        if let Some(t) = self.normed_thresh {
            if !t.is_finite() || t < 0.0 {
                return Err(MpError::InvalidConfig(
                    "normed_thresh must be finite and >= 0",
                ));
            }
        }
        if let Some(eps) = self.mask_epsilon {
            if !eps.is_finite() {
                return Err(MpError::InvalidConfig("mask_epsilon must be finite"));
            }
        }
        if !self.sparsity_penalty.is_finite() || self.sparsity_penalty < 0.0 {
            return Err(MpError::InvalidConfig(
                "sparsity_penalty must be finite and >= 0",
            ));
        }
        Ok(())
    }

    /// Fill in kernel-size dependent defaults.
    pub fn resolve(&self, kernel_size: usize) -> Thresholds {
        let ks = kernel_size.max(1) as f32;
        let normed_thresh = self.normed_thresh.unwrap_or(2.0 / ks.sqrt());
        let mask_epsilon = match self.mask_epsilon {
            Some(eps) if eps != 0.0 => eps,
            _ => 0.01 * (1.0 / ks).sqrt(),
        };
        Thresholds {
            thresh: self.thresh,
            normed_thresh,
            mask_epsilon,
        }
    }

    pub fn with_thresh(mut self, thresh: f32) -> Self {
        self.thresh = thresh;
        self
    }

    pub fn with_normed_thresh(mut self, normed_thresh: f32) -> Self {
        self.normed_thresh = Some(normed_thresh);
        self
    }

    pub fn with_mask_epsilon(mut self, mask_epsilon: f32) -> Self {
        self.mask_epsilon = Some(mask_epsilon);
        self
    }

    pub fn with_gradient_flow(mut self, flow: GradientFlow) -> Self {
        self.gradient_flow = flow;
        self
    }

    pub fn with_gating(mut self, gating: GatingPolicy) -> Self {
        self.gating = gating;
        self
    }

    pub fn with_sparsity_penalty(mut self, penalty: f32) -> Self {
        self.sparsity_penalty = penalty;
        self
    }

    pub fn with_execution_tier(mut self, tier: ExecutionTier) -> Self {
        self.execution_tier = tier;
        self
    }
}

#[cfg(feature = "serde")]
impl MpConfig {
    /// Parse and validate a JSON config. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: MpConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_json(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
