//! Error types for mask tokenization.

use thiserror::Error;

/// Errors raised while turning masks and feature grids into tokens.
#[derive(Debug, Error)]
pub enum MaskTokenError {
    /// A tensor did not have the rank or dimensions an operation requires.
    #[error("shape mismatch in {op}: expected {expected}, got {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        got: Vec<usize>,
    },

    /// The image batch and the list of per-image masks disagree on batch size.
    #[error("batch size mismatch: {images} images but {masks} mask lists")]
    BatchSizeMismatch { images: usize, masks: usize },

    /// A mask with zero pixels was handed to the rasterizer.
    #[error("input mask is empty (0 pixels)")]
    EmptyMask,

    /// The feature grid cannot be viewed as a square spatial layout.
    #[error("feature grid of {tokens} tokens is not a square grid")]
    NonSquareGrid { tokens: usize },

    /// Both mask removal and mask limiting were requested.
    #[error("conflicting composition policy: {0}")]
    ConflictingPolicy(&'static str),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl MaskTokenError {
    pub(crate) fn shape(op: &'static str, expected: impl Into<String>, got: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.into(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MaskTokenError>;
