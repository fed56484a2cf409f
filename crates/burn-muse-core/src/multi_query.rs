//! Multi-query attention
//!
//! Many query heads share a single key/value head. Queries get a full
//! `d -> d` projection while keys and values together get `d -> 2 * d / h`,
//! which keeps the KV projection (and any KV cache) `h` times smaller than in
//! multi-head attention.
//!
//! The same module serves self-attention (`context = None`) and
//! cross-attention to an external sequence such as text-encoder output.
//!
//! # References
//!
//! - [Fast Transformer Decoding: One Write-Head is All You Need](https://arxiv.org/abs/1911.02150)

use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;

use crate::attention::{AttentionStrategy, ScaledDotProduct};
use crate::error::LayerError;

/// Multi-query attention over flattened token sequences
#[derive(Module, Debug)]
pub struct MultiQueryAttention<B: Backend> {
    /// Query projection `d -> d`
    pub to_q: Linear<B>,
    /// Shared key/value projection `d -> 2 * head_dim`
    pub to_kv: Linear<B>,
    /// Output projection `d -> d`
    pub to_o: Linear<B>,
    pub attn_dropout: Dropout,
    #[module(skip)]
    pub num_heads: usize,
    #[module(skip)]
    pub head_dim: usize,
    #[module(skip)]
    pub strategy: AttentionStrategy,
}

/// Configuration for [`MultiQueryAttention`]
#[derive(Debug, Clone)]
pub struct MultiQueryAttentionConfig {
    /// Embedding dimension `d`
    pub emb_dim: usize,
    /// Number of query heads `h`
    pub num_heads: usize,
    /// Dropout rate on attention weights (training only)
    pub dropout: f64,
    /// Attention kernel
    pub strategy: AttentionStrategy,
}

impl MultiQueryAttentionConfig {
    pub fn new(emb_dim: usize, num_heads: usize, dropout: f64) -> Self {
        Self {
            emb_dim,
            num_heads,
            dropout,
            strategy: AttentionStrategy::detect(),
        }
    }

    pub fn with_strategy(mut self, strategy: AttentionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Initializes the attention module
    ///
    /// Fails if `emb_dim` is not divisible by `num_heads`.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<MultiQueryAttention<B>, LayerError> {
        if self.num_heads == 0 || self.emb_dim % self.num_heads != 0 {
            return Err(LayerError::HeadsNotDivisible {
                dim: self.emb_dim,
                heads: self.num_heads,
            });
        }
        let head_dim = self.emb_dim / self.num_heads;

        tracing::debug!(
            emb_dim = self.emb_dim,
            num_heads = self.num_heads,
            strategy = ?self.strategy,
            "init multi-query attention"
        );

        Ok(MultiQueryAttention {
            to_q: LinearConfig::new(self.emb_dim, self.emb_dim)
                .with_bias(false)
                .init(device),
            to_kv: LinearConfig::new(self.emb_dim, 2 * head_dim)
                .with_bias(false)
                .init(device),
            to_o: LinearConfig::new(self.emb_dim, self.emb_dim)
                .with_bias(false)
                .init(device),
            attn_dropout: DropoutConfig::new(self.dropout).init(),
            num_heads: self.num_heads,
            head_dim,
            strategy: self.strategy,
        })
    }
}

impl<B: Backend> MultiQueryAttention<B> {
    /// Embedding dimension `d`
    pub fn emb_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Query scale `head_dim^-0.5`
    pub fn scale(&self) -> f64 {
        (self.head_dim as f64).powf(-0.5)
    }

    /// Self- or cross-attention
    ///
    /// # Arguments
    ///
    /// * `input` - Query source `[batch, ..., d]`
    /// * `context` - Key/value source `[batch, seq_ctx, d]`; `None` attends to
    ///   `input` itself
    ///
    /// # Returns
    ///
    /// Tensor with the shape of `input`
    pub fn forward<const D: usize>(
        &self,
        input: Tensor<B, D>,
        context: Option<Tensor<B, 3>>,
    ) -> Tensor<B, D> {
        let dims = input.dims();
        let batch = dims[0];
        let seq_len: usize = dims[1..D - 1].iter().product();
        let emb_dim = self.emb_dim();
        let (heads, head_dim) = (self.num_heads, self.head_dim);

        // [batch, ..., d] -> [batch, seq, d]
        let x: Tensor<B, 3> = input.reshape([batch, seq_len, emb_dim]);
        let context = context.unwrap_or_else(|| x.clone());

        // [batch, heads, seq, head_dim]
        let q = self
            .to_q
            .forward(x)
            .reshape([batch, seq_len, heads, head_dim])
            .swap_dims(1, 2)
            * self.scale();

        let kv = self.to_kv.forward(context);
        let k = kv.clone().narrow(2, 0, head_dim);
        let v = kv.narrow(2, head_dim, head_dim);

        // Fold heads into the query axis so the single KV head is shared
        // without repeating it: [batch, heads * seq, head_dim]
        let q = q.reshape([batch, heads * seq_len, head_dim]);
        let y = self.strategy.attend(q, k, v, &self.attn_dropout);

        let y = y
            .reshape([batch, heads, seq_len, head_dim])
            .swap_dims(1, 2)
            .reshape([batch, seq_len, emb_dim]);

        self.to_o.forward(y).reshape(dims)
    }
}
