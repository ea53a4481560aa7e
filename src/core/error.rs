use std::io;

use thiserror::Error;

/// Errors surfaced by dictionary construction, configuration and inference.
///
/// Degenerate kernel masks and silent (zero-norm) segments are not errors:
/// both have defined fallback behaviour inside the engine.
#[derive(Debug, Error)]
pub enum MpError {
    /// Input could not be viewed as a `(rows, cols)` batch.
    #[error("shape mismatch: {what} (expected {expected}, got {got})")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// A dictionary with zero kernels or zero-length kernels.
    #[error("invalid dictionary: {0}")]
    InvalidDictionary(&'static str),

    /// Gradients were requested from an inference run without a tape.
    #[error("inference ran detached; no gradient tape was recorded")]
    NotDifferentiable,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, MpError>;

impl MpError {
    pub(crate) fn shape(what: &'static str, expected: usize, got: usize) -> Self {
        MpError::ShapeMismatch {
            what,
            expected,
            got,
        }
    }
}
