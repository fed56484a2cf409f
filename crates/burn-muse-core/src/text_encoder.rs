//! Frozen text encoder access
//!
//! The generator only needs text as a `[batch, seq, d]` context tensor for
//! cross-attention. Any encoder behind [`TextEncoder`] can provide it; the
//! pretrained weights are loaded by a [`PretrainedLoader`] and frozen by
//! [`get_text_encoder`], so no gradient ever flows into them.
//!
//! [`TokenEncoder`] is a small encoder assembled from this crate's own
//! [`EncoderBlock`]s.

use std::marker::PhantomData;

use burn::module::Param;
use burn::nn::{Embedding, EmbeddingConfig};
use burn::prelude::*;
use burn::tensor::Int;
use serde::{Deserialize, Serialize};

use crate::attention::AttentionStrategy;
use crate::blocks::{BlockConfig, EncoderBlock};
use crate::error::LayerError;
use crate::layernorm::LayerNorm;

/// Turns token ids into context embeddings
pub trait TextEncoder<B: Backend>: Module<B> {
    /// Encodes `[batch, seq]` token ids into `[batch, seq, embed_dim]`
    fn encode(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3>;

    /// Width of the produced embeddings
    fn embed_dim(&self) -> usize;
}

/// Source of pretrained encoders, addressed by an identifier
pub trait PretrainedLoader<B: Backend> {
    type Encoder: TextEncoder<B>;
    type Error: std::error::Error;

    fn load(&self, identifier: &str, device: &B::Device) -> Result<Self::Encoder, Self::Error>;
}

/// A text encoder with gradient tracking disabled on every parameter
#[derive(Debug, Clone)]
pub struct FrozenTextEncoder<B: Backend, E> {
    encoder: E,
    _backend: PhantomData<B>,
}

impl<B: Backend, E: TextEncoder<B>> FrozenTextEncoder<B, E> {
    /// Freezes `encoder`
    pub fn new(encoder: E) -> Self {
        Self {
            encoder: encoder.no_grad(),
            _backend: PhantomData,
        }
    }

    /// Encodes tokens into a detached context tensor
    pub fn encode(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.encoder.encode(tokens).detach()
    }

    pub fn embed_dim(&self) -> usize {
        self.encoder.embed_dim()
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn into_inner(self) -> E {
        self.encoder
    }
}

/// Loads the encoder named by `identifier` and freezes it
///
/// Loader errors are returned unchanged.
pub fn get_text_encoder<B, L>(
    loader: &L,
    identifier: &str,
    device: &B::Device,
) -> Result<FrozenTextEncoder<B, L::Encoder>, L::Error>
where
    B: Backend,
    L: PretrainedLoader<B>,
{
    let encoder = loader.load(identifier, device)?;
    tracing::debug!(
        identifier,
        num_params = encoder.num_params(),
        "froze text encoder"
    );
    Ok(FrozenTextEncoder::new(encoder))
}

/// Configuration for [`TokenEncoder`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEncoderConfig {
    pub vocab_size: usize,
    pub emb_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    /// Maximum sequence length
    pub context_length: usize,
}

impl TokenEncoderConfig {
    pub fn new(
        vocab_size: usize,
        emb_dim: usize,
        num_heads: usize,
        num_layers: usize,
        context_length: usize,
    ) -> Self {
        Self {
            vocab_size,
            emb_dim,
            num_heads,
            num_layers,
            context_length,
        }
    }

    /// Tiny model for testing
    pub fn tiny() -> Self {
        Self::new(64, 24, 4, 2, 16)
    }

    /// Initializes the encoder; attention always uses the explicit kernel
    /// since text sequences are short
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TokenEncoder<B>, LayerError> {
        let block = BlockConfig::new(self.emb_dim, self.num_heads, 0.0)
            .with_strategy(AttentionStrategy::Explicit);
        let layers = (0..self.num_layers)
            .map(|_| block.init_encoder(device))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TokenEncoder {
            token_embedding: EmbeddingConfig::new(self.vocab_size, self.emb_dim).init(device),
            position_embedding: Param::from_tensor(Tensor::zeros(
                [self.context_length, self.emb_dim],
                device,
            )),
            layers,
            final_norm: LayerNorm::new(self.emb_dim, device),
            context_length: self.context_length,
        })
    }
}

/// Token embedding, learned positions, [`EncoderBlock`] stack, final norm
#[derive(Module, Debug)]
pub struct TokenEncoder<B: Backend> {
    pub token_embedding: Embedding<B>,
    pub position_embedding: Param<Tensor<B, 2>>,
    pub layers: Vec<EncoderBlock<B>>,
    pub final_norm: LayerNorm<B>,
    #[module(skip)]
    pub context_length: usize,
}

impl<B: Backend> TextEncoder<B> for TokenEncoder<B> {
    /// Sequences longer than the context length are truncated to it
    fn encode(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [_batch, seq_len] = tokens.dims();
        let tokens = if seq_len > self.context_length {
            tracing::warn!(
                seq_len,
                context_length = self.context_length,
                "truncating token sequence to context length"
            );
            tokens.narrow(1, 0, self.context_length)
        } else {
            tokens
        };
        let seq_len = seq_len.min(self.context_length);

        let positions = self
            .position_embedding
            .val()
            .slice([0..seq_len])
            .unsqueeze::<3>();
        let mut x = self.token_embedding.forward(tokens) + positions;

        for layer in &self.layers {
            x = layer.forward(x);
        }

        self.final_norm.forward(x)
    }

    fn embed_dim(&self) -> usize {
        self.final_norm.size()
    }
}
