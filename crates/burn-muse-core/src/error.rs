//! Shape and configuration errors raised by the layers in this crate

use thiserror::Error;

/// Precondition violations detected before any tensor op runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("embedding dim {dim} is not divisible by {heads} heads")]
    HeadsNotDivisible { dim: usize, heads: usize },

    #[error("multi-axis attention needs an even head count, got {heads}")]
    OddHeadCount { heads: usize },

    #[error("MLP inner dim {inner_dim} (from emb_dim {emb_dim}) must be even for GEGLU")]
    OddInnerDim { emb_dim: usize, inner_dim: usize },

    #[error("block size must be non-zero")]
    ZeroBlockSize,

    #[error("image must be square, got {height}x{width}")]
    NonSquareImage { height: usize, width: usize },

    #[error("image side {side} is not divisible by block size {block_size}")]
    BlockSizeMismatch { side: usize, block_size: usize },

    #[error("{patches} patches of {pixels} pixels cannot be laid out as a square image with block size {block_size}")]
    PatchLayout {
        patches: usize,
        pixels: usize,
        block_size: usize,
    },
}
