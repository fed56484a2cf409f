//! Scaled dot-product attention kernels
//!
//! Three interchangeable implementations of
//!
//! ```text
//! out = dropout(softmax(q @ k^T)) @ v
//! ```
//!
//! over the last two axes of rank-`D` tensors:
//!
//! - [`FusedAttention`] calls the backend's attention primitive
//!   ([`burn::tensor::module::attention`]), which backends may lower to a
//!   fused kernel.
//! - [`ExplicitAttention`] materializes the full score matrix.
//! - [`TiledAttention`] streams keys in chunks with an online softmax, so
//!   memory is O(seq_q * chunk) instead of O(seq_q * seq_k).
//!
//! All expect queries that are already scaled by `head_dim^-0.5`. Dropout
//! follows [`burn::nn::Dropout`]: it is only active on autodiff backends with
//! a non-zero rate.

use core::fmt;

use burn::constant;
use burn::nn::Dropout;
use burn::prelude::*;
use burn::tensor::Distribution;

/// Default key chunk for [`TiledAttention`]
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Scaled dot-product attention over the last two axes
///
/// * `q` - `[..., seq_q, head_dim]`
/// * `k` - `[..., seq_k, head_dim]`
/// * `v` - `[..., seq_k, val_dim]`
///
/// Returns `[..., seq_q, val_dim]`. Leading axes must match exactly.
pub trait ScaledDotProduct {
    fn attend<B: Backend, const D: usize>(
        &self,
        q: Tensor<B, D>,
        k: Tensor<B, D>,
        v: Tensor<B, D>,
        dropout: &Dropout,
    ) -> Tensor<B, D>;
}

/// Softmax-then-matmul attention
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitAttention;

impl ScaledDotProduct for ExplicitAttention {
    fn attend<B: Backend, const D: usize>(
        &self,
        q: Tensor<B, D>,
        k: Tensor<B, D>,
        v: Tensor<B, D>,
        dropout: &Dropout,
    ) -> Tensor<B, D> {
        if let Some(out) = empty_keys(&q, &k, &v) {
            return out;
        }

        let scores = q.matmul(k.swap_dims(D - 2, D - 1));
        let weights = burn::tensor::activation::softmax(scores, D - 1);
        dropout.forward(weights).matmul(v)
    }
}

/// Attention through the backend primitive
///
/// The primitive works on `[batch, heads, seq, head_dim]` and has no dropout,
/// so leading axes are folded into the batch, and training with a non-zero
/// dropout rate runs [`ExplicitAttention`] instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusedAttention;

impl ScaledDotProduct for FusedAttention {
    fn attend<B: Backend, const D: usize>(
        &self,
        q: Tensor<B, D>,
        k: Tensor<B, D>,
        v: Tensor<B, D>,
        dropout: &Dropout,
    ) -> Tensor<B, D> {
        if B::ad_enabled() && dropout.prob > 0.0 {
            return ExplicitAttention.attend(q, k, v, dropout);
        }
        if let Some(out) = empty_keys(&q, &k, &v) {
            return out;
        }

        let q_dims = q.dims();
        let [seq_q, head_dim] = [q_dims[D - 2], q_dims[D - 1]];
        let [seq_k, val_dim] = [k.dims()[D - 2], v.dims()[D - 1]];
        let batch: usize = q_dims[..D - 2].iter().product();

        // The primitive divides by sqrt(head_dim) itself
        let q = q.reshape([batch, 1, seq_q, head_dim]) * (head_dim as f64).sqrt();
        let k = k.reshape([batch, 1, seq_k, head_dim]);
        let v = v.reshape([batch, 1, seq_k, val_dim]);

        let mut out_dims = q_dims;
        out_dims[D - 1] = val_dim;
        burn::tensor::module::attention(q, k, v, None).reshape(out_dims)
    }
}

/// Chunked attention with an online softmax
#[derive(Debug, Clone, Copy)]
pub struct TiledAttention {
    /// Number of keys processed per step
    pub chunk_size: usize,
}

impl Default for TiledAttention {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Running statistics of the online softmax
struct OnlineSoftmax<B: Backend, const D: usize> {
    /// Row maximum of all scores seen so far `[..., seq_q, 1]`
    max: Tensor<B, D>,
    /// Sum of `exp(score - max)` `[..., seq_q, 1]`
    denom: Tensor<B, D>,
    /// Unnormalized output `[..., seq_q, val_dim]`
    acc: Tensor<B, D>,
}

impl ScaledDotProduct for TiledAttention {
    fn attend<B: Backend, const D: usize>(
        &self,
        q: Tensor<B, D>,
        k: Tensor<B, D>,
        v: Tensor<B, D>,
        dropout: &Dropout,
    ) -> Tensor<B, D> {
        if let Some(out) = empty_keys(&q, &k, &v) {
            return out;
        }

        let seq_k = k.dims()[D - 2];
        let chunk_size = self.chunk_size.max(1);
        let drop_prob = if B::ad_enabled() { dropout.prob } else { 0.0 };

        let mut state: Option<OnlineSoftmax<B, D>> = None;
        for start in (0..seq_k).step_by(chunk_size) {
            let len = chunk_size.min(seq_k - start);
            let k_chunk = k.clone().narrow(D - 2, start, len);
            let v_chunk = v.clone().narrow(D - 2, start, len);

            let scores = q.clone().matmul(k_chunk.swap_dims(D - 2, D - 1));
            let chunk_max = scores.clone().max_dim(D - 1);
            let max = match &state {
                Some(s) => s.max.clone().max_pair(chunk_max),
                None => chunk_max,
            };

            let weights = (scores - max.clone()).exp();
            let chunk_denom = weights.clone().sum_dim(D - 1);
            // The normalizer always sees the undropped weights
            let chunk_out = drop_weights(weights, drop_prob).matmul(v_chunk);

            state = Some(match state {
                Some(prev) => {
                    let correction = (prev.max - max.clone()).exp();
                    OnlineSoftmax {
                        max,
                        denom: prev.denom * correction.clone() + chunk_denom,
                        acc: prev.acc * correction + chunk_out,
                    }
                }
                None => OnlineSoftmax {
                    max,
                    denom: chunk_denom,
                    acc: chunk_out,
                },
            });
        }

        match state {
            Some(s) => s.acc / s.denom,
            None => zero_output(&q, &v),
        }
    }
}

/// Zeroes weights with probability `prob` and rescales the survivors,
/// the way `burn::nn::Dropout` does
fn drop_weights<B: Backend, const D: usize>(weights: Tensor<B, D>, prob: f64) -> Tensor<B, D> {
    if prob == 0.0 {
        return weights;
    }

    let mask = weights
        .random_like(Distribution::Bernoulli(prob))
        .equal_elem(1);
    weights.mask_fill(mask, 0.0) * (1.0 / (1.0 - prob))
}

/// Output for a zero-length key axis, where softmax is undefined
fn empty_keys<B: Backend, const D: usize>(
    q: &Tensor<B, D>,
    k: &Tensor<B, D>,
    v: &Tensor<B, D>,
) -> Option<Tensor<B, D>> {
    (k.dims()[D - 2] == 0).then(|| zero_output(q, v))
}

fn zero_output<B: Backend, const D: usize>(q: &Tensor<B, D>, v: &Tensor<B, D>) -> Tensor<B, D> {
    let mut out_dims = q.dims();
    out_dims[D - 1] = v.dims()[D - 1];
    Tensor::zeros(out_dims, &q.device())
}

/// Attention kernel selection
///
/// All variants satisfy the same shape contract and agree up to floating
/// point rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionStrategy {
    /// [`ExplicitAttention`]
    Explicit,
    /// [`FusedAttention`]
    Fused,
    /// [`TiledAttention`] with the given key chunk
    Tiled { chunk_size: usize },
}

impl AttentionStrategy {
    /// Prefers the backend attention primitive when it is compiled in
    ///
    /// Returns [`AttentionStrategy::Fused`] if the `fused-attention` feature is
    /// enabled, [`AttentionStrategy::Explicit`] otherwise.
    pub fn detect() -> Self {
        let strategy = if is_fused_available() {
            Self::Fused
        } else {
            Self::Explicit
        };
        tracing::debug!(%strategy, "selected attention kernel");
        strategy
    }
}

impl Default for AttentionStrategy {
    fn default() -> Self {
        Self::detect()
    }
}

impl fmt::Display for AttentionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::Fused => write!(f, "fused"),
            Self::Tiled { chunk_size } => write!(f, "tiled({chunk_size})"),
        }
    }
}

// Held by modules as a constant, like their head counts
constant!(AttentionStrategy);

impl ScaledDotProduct for AttentionStrategy {
    fn attend<B: Backend, const D: usize>(
        &self,
        q: Tensor<B, D>,
        k: Tensor<B, D>,
        v: Tensor<B, D>,
        dropout: &Dropout,
    ) -> Tensor<B, D> {
        match *self {
            Self::Explicit => ExplicitAttention.attend(q, k, v, dropout),
            Self::Fused => FusedAttention.attend(q, k, v, dropout),
            Self::Tiled { chunk_size } => TiledAttention { chunk_size }.attend(q, k, v, dropout),
        }
    }
}

/// Whether [`AttentionStrategy::detect`] picks the backend primitive
#[inline]
pub const fn is_fused_available() -> bool {
    cfg!(feature = "fused-attention")
}
