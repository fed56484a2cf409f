//! Transformer blocks for the text-conditioned image generator
//!
//! All three blocks wrap attention in a pre-norm residual and finish with the
//! GEGLU [`Mlp`]. The MLP output is returned as is: there is no residual
//! connection around it.
//!
//! ```text
//! EncoderBlock               x = x + self_attn(ln1(x));  mlp(x)
//! TransformerBlock           x = x + self_attn(ln1(x));  x = x + cross_attn(ln2(x), ctx)?;  mlp(x)
//! MultiAxisTransformerBlock  x = blocks(img) + multi_axis(ln1(...));  x = x + cross_attn(ln2(x), ctx);  mlp(x)
//! ```

use burn::prelude::*;

use crate::attention::AttentionStrategy;
use crate::error::LayerError;
use crate::glu::{Mlp, MlpConfig};
use crate::layernorm::LayerNorm;
use crate::multi_axis::{block_image, MultiAxisAttention, MultiAxisAttentionConfig};
use crate::multi_query::{MultiQueryAttention, MultiQueryAttentionConfig};

/// Self-attention followed by the MLP, on flattened tokens
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub ln1: LayerNorm<B>,
    pub self_attn: MultiQueryAttention<B>,
    pub mlp: Mlp<B>,
}

/// Configuration for [`EncoderBlock`] and [`TransformerBlock`]
#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// Embedding dimension
    pub emb_dim: usize,
    /// Number of query heads
    pub num_heads: usize,
    /// Dropout rate on attention weights
    pub dropout: f64,
    /// Attention kernel
    pub strategy: AttentionStrategy,
}

impl BlockConfig {
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

    fn attention<B: Backend>(&self, device: &B::Device) -> Result<MultiQueryAttention<B>, LayerError> {
        MultiQueryAttentionConfig::new(self.emb_dim, self.num_heads, self.dropout)
            .with_strategy(self.strategy)
            .init(device)
    }

    /// Initializes an [`EncoderBlock`]
    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> Result<EncoderBlock<B>, LayerError> {
        Ok(EncoderBlock {
            ln1: LayerNorm::new(self.emb_dim, device),
            self_attn: self.attention(device)?,
            mlp: MlpConfig::new(self.emb_dim).init(device)?,
        })
    }

    /// Initializes a [`TransformerBlock`]
    pub fn init_transformer<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<TransformerBlock<B>, LayerError> {
        Ok(TransformerBlock {
            ln1: LayerNorm::new(self.emb_dim, device),
            self_attn: self.attention(device)?,
            ln2: LayerNorm::new(self.emb_dim, device),
            cross_attn: self.attention(device)?,
            mlp: MlpConfig::new(self.emb_dim).init(device)?,
        })
    }
}

impl<B: Backend> EncoderBlock<B> {
    /// `[batch, seq, d]` -> `[batch, seq, d]`
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = input.clone() + self.self_attn.forward(self.ln1.forward(input), None);
        self.mlp.forward(x)
    }
}

/// Self-attention, optional cross-attention to a context sequence, MLP
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    pub ln1: LayerNorm<B>,
    pub self_attn: MultiQueryAttention<B>,
    pub ln2: LayerNorm<B>,
    pub cross_attn: MultiQueryAttention<B>,
    pub mlp: Mlp<B>,
}

impl<B: Backend> TransformerBlock<B> {
    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `input` - Queries `[batch, seq, d]`
    /// * `context` - Optional conditioning `[batch, seq_ctx, d]`; the
    ///   cross-attention branch is skipped when absent
    pub fn forward(&self, input: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let x = input.clone() + self.self_attn.forward(self.ln1.forward(input), None);
        let x = match context {
            Some(ctx) => x.clone() + self.cross_attn.forward(self.ln2.forward(x), Some(ctx)),
            None => x,
        };
        self.mlp.forward(x)
    }
}

/// Multi-axis image self-attention, cross-attention to text, MLP
#[derive(Module, Debug)]
pub struct MultiAxisTransformerBlock<B: Backend> {
    pub ln1: LayerNorm<B>,
    pub self_attn: MultiAxisAttention<B>,
    pub ln2: LayerNorm<B>,
    pub cross_attn: MultiQueryAttention<B>,
    pub mlp: Mlp<B>,
}

/// Configuration for [`MultiAxisTransformerBlock`]
#[derive(Debug, Clone)]
pub struct MultiAxisBlockConfig {
    /// Channel count of the image and the context
    pub channels: usize,
    /// Patch side
    pub block_size: usize,
    /// Number of heads for both attentions
    pub num_heads: usize,
    /// Dropout rate on attention weights
    pub dropout: f64,
    /// Attention kernel
    pub strategy: AttentionStrategy,
}

impl MultiAxisBlockConfig {
    pub fn new(channels: usize, block_size: usize, num_heads: usize, dropout: f64) -> Self {
        Self {
            channels,
            block_size,
            num_heads,
            dropout,
            strategy: AttentionStrategy::detect(),
        }
    }

    pub fn with_strategy(mut self, strategy: AttentionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Initializes the block
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<MultiAxisTransformerBlock<B>, LayerError> {
        Ok(MultiAxisTransformerBlock {
            ln1: LayerNorm::new(self.channels, device),
            self_attn: MultiAxisAttentionConfig::new(
                self.channels,
                self.block_size,
                self.num_heads,
                self.dropout,
            )
            .with_strategy(self.strategy)
            .init(device)?,
            ln2: LayerNorm::new(self.channels, device),
            cross_attn: MultiQueryAttentionConfig::new(self.channels, self.num_heads, self.dropout)
                .with_strategy(self.strategy)
                .init(device)?,
            mlp: MlpConfig::new(self.channels).init(device)?,
        })
    }
}

impl<B: Backend> MultiAxisTransformerBlock<B> {
    /// Forward pass
    ///
    /// Channel layer norm acts per pixel, so normalizing the blocked tokens is
    /// the same as blocking the normalized image.
    ///
    /// # Arguments
    ///
    /// * `input` - Square image `[batch, c, side, side]`
    /// * `context` - Text conditioning `[batch, seq_ctx, c]`
    ///
    /// # Returns
    ///
    /// Blocked hidden state `[batch, n, p, c]`
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        context: Tensor<B, 3>,
    ) -> Result<Tensor<B, 4>, LayerError> {
        let tokens = block_image(input, self.self_attn.block_size)?;

        let x = tokens.clone() + self.self_attn.forward_blocks(self.ln1.forward(tokens));
        let x = x.clone() + self.cross_attn.forward(self.ln2.forward(x), Some(context));

        Ok(self.mlp.forward(x))
    }
}
