//! # causalmp
//!
//! Causal greedy matching pursuit over a convolutional kernel dictionary.
//!
//! Given a batch of 1-D signals and a bank of time-localised kernels, the
//! engine produces a sparse activation map that explains each signal as a
//! sum of shifted, scaled kernel copies. A kernel's activation at time `t`
//! only sees residual samples at or after `t` inside its own window, and the
//! window is read before any later step touches it.
//!
//! ## Quick Start
//!
//! ```
//! use causalmp::prelude::*;
//!
//! let bank = KernelBank::random(4, 16, 42).unwrap();
//! let mp = CausalMp::new(bank, MpConfig::default()).unwrap();
//!
//! let signal = SignalBatch::single(&[0.0; 64]).unwrap();
//! let (acts, meta) = mp.infer(&signal).unwrap();
//! assert_eq!(acts.l_signal(), 64);
//! assert_eq!(meta.residual.width(), 64 + 16 - 1);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): Serialization for configs and results, JSON config loading
//! - `parallel`: Spread batch rows across threads within each time step via rayon
//! - `simd`: f32x4 inner products via the `wide` crate
//!
//! ## Modules
//!
//! - [`engine`]: The inference loop
//! - [`mask`]: Kernel support masks
//! - [`dictionary`]: Dictionary capability and the owned `KernelBank`
//! - [`config`]: Thresholds, gating and gradient-flow policies
//! - [`loss`] / [`tape`]: Losses and back-propagation through recorded decisions

#[path = "core/config.rs"]
pub mod config;

#[path = "core/dictionary.rs"]
pub mod dictionary;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/linalg.rs"]
pub mod linalg;

#[path = "core/loss.rs"]
pub mod loss;

#[path = "core/mask.rs"]
pub mod mask;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/signal.rs"]
pub mod signal;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/tape.rs"]
pub mod tape;

/// Prelude module for convenient imports.
///
/// ```
/// use causalmp::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ExecutionTier, GatingPolicy, GradientFlow, MpConfig, Thresholds};
    pub use crate::dictionary::{Dictionary, KernelBank};
    pub use crate::engine::CausalMp;
    pub use crate::error::{MpError, Result};
    pub use crate::loss::LossKind;
    pub use crate::mask::KernelMasks;
    pub use crate::signal::{Activations, InferenceMeta, Padded, SignalBatch, Spike};
    pub use crate::tape::{InferenceTape, StepRecord};
}
