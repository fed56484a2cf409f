//! Layer weight loading from PyTorch-named state dicts
//!
//! Tensor names follow the PyTorch module tree, e.g. a transformer block
//! under `blocks.0` reads `blocks.0.ln1.weight`, `blocks.0.self_attn.to_q.weight`
//! and `blocks.0.mlp.proj1.weight`.
//!
//! Each loader builds the module from its config first and then replaces the
//! parameters, so dropout rates and attention strategies come from the config
//! while every weight comes from the file.

use std::path::Path;

use burn::module::Param;
use burn::nn::Linear;
use burn::prelude::*;

use burn_muse_core::{
    BlockConfig, EncoderBlock, LayerNorm, Mlp, MlpConfig, MultiAxisAttention,
    MultiAxisAttentionConfig, MultiAxisBlockConfig, MultiAxisTransformerBlock,
    MultiQueryAttention, MultiQueryAttentionConfig, TokenEncoder, TokenEncoderConfig,
    TransformerBlock,
};

use crate::loader::{LoadError, SafeTensorFile};

/// Loads burn-muse layers from a safetensors state dict
pub struct MuseWeightLoader {
    file: SafeTensorFile,
}

impl MuseWeightLoader {
    /// Open a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        Ok(Self::new(SafeTensorFile::open(path)?))
    }

    pub fn new(file: SafeTensorFile) -> Self {
        Self { file }
    }

    /// The underlying file
    pub fn file(&self) -> &SafeTensorFile {
        &self.file
    }

    /// Load `{prefix}.weight` (`[out, in]`) and the optional `{prefix}.bias`
    fn linear<B: Backend>(
        &self,
        prefix: &str,
        mut linear: Linear<B>,
        device: &B::Device,
    ) -> Result<Linear<B>, LoadError> {
        let [d_in, d_out] = linear.weight.dims();

        // PyTorch stores [out_features, in_features]; burn expects [in, out]
        let weight: Tensor<B, 2> =
            self.file
                .load_f32_checked(&format!("{prefix}.weight"), [d_out, d_in], device)?;
        linear.weight = Param::from_tensor(weight.transpose());

        let bias_key = format!("{prefix}.bias");
        if self.file.contains(&bias_key) {
            let bias: Tensor<B, 1> = self.file.load_f32_checked(&bias_key, [d_out], device)?;
            linear.bias = Some(Param::from_tensor(bias));
        }

        Ok(linear)
    }

    fn layer_norm<B: Backend>(
        &self,
        prefix: &str,
        norm: LayerNorm<B>,
        device: &B::Device,
    ) -> Result<LayerNorm<B>, LoadError> {
        let size = norm.size();
        let weight = self
            .file
            .load_f32_checked(&format!("{prefix}.weight"), [size], device)?;
        let bias = self
            .file
            .load_f32_checked(&format!("{prefix}.bias"), [size], device)?;

        Ok(LayerNorm {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            eps: norm.eps,
        })
    }

    fn mlp_weights<B: Backend>(
        &self,
        prefix: &str,
        mlp: Mlp<B>,
        device: &B::Device,
    ) -> Result<Mlp<B>, LoadError> {
        Ok(Mlp {
            ln1: self.layer_norm(&format!("{prefix}.ln1"), mlp.ln1, device)?,
            proj1: self.linear(&format!("{prefix}.proj1"), mlp.proj1, device)?,
            ln2: self.layer_norm(&format!("{prefix}.ln2"), mlp.ln2, device)?,
            proj2: self.linear(&format!("{prefix}.proj2"), mlp.proj2, device)?,
        })
    }

    fn multi_query_weights<B: Backend>(
        &self,
        prefix: &str,
        attn: MultiQueryAttention<B>,
        device: &B::Device,
    ) -> Result<MultiQueryAttention<B>, LoadError> {
        Ok(MultiQueryAttention {
            to_q: self.linear(&format!("{prefix}.to_q"), attn.to_q, device)?,
            to_kv: self.linear(&format!("{prefix}.to_kv"), attn.to_kv, device)?,
            to_o: self.linear(&format!("{prefix}.to_o"), attn.to_o, device)?,
            ..attn
        })
    }

    fn multi_axis_weights<B: Backend>(
        &self,
        prefix: &str,
        attn: MultiAxisAttention<B>,
        device: &B::Device,
    ) -> Result<MultiAxisAttention<B>, LoadError> {
        Ok(MultiAxisAttention {
            to_qkv: self.linear(&format!("{prefix}.to_qkv"), attn.to_qkv, device)?,
            ..attn
        })
    }

    fn encoder_block_weights<B: Backend>(
        &self,
        prefix: &str,
        block: EncoderBlock<B>,
        device: &B::Device,
    ) -> Result<EncoderBlock<B>, LoadError> {
        Ok(EncoderBlock {
            ln1: self.layer_norm(&format!("{prefix}.ln1"), block.ln1, device)?,
            self_attn: self.multi_query_weights(&format!("{prefix}.self_attn"), block.self_attn, device)?,
            mlp: self.mlp_weights(&format!("{prefix}.mlp"), block.mlp, device)?,
        })
    }

    /// Load an [`Mlp`] from `{prefix}.ln1`, `{prefix}.proj1`, `{prefix}.ln2`, `{prefix}.proj2`
    pub fn load_mlp<B: Backend>(
        &self,
        prefix: &str,
        config: &MlpConfig,
        device: &B::Device,
    ) -> Result<Mlp<B>, LoadError> {
        self.mlp_weights(prefix, config.init(device)?, device)
    }

    /// Load a [`MultiQueryAttention`] from `{prefix}.to_q`, `{prefix}.to_kv`, `{prefix}.to_o`
    pub fn load_multi_query_attention<B: Backend>(
        &self,
        prefix: &str,
        config: &MultiQueryAttentionConfig,
        device: &B::Device,
    ) -> Result<MultiQueryAttention<B>, LoadError> {
        self.multi_query_weights(prefix, config.init(device)?, device)
    }

    /// Load a [`MultiAxisAttention`] from `{prefix}.to_qkv`
    pub fn load_multi_axis_attention<B: Backend>(
        &self,
        prefix: &str,
        config: &MultiAxisAttentionConfig,
        device: &B::Device,
    ) -> Result<MultiAxisAttention<B>, LoadError> {
        self.multi_axis_weights(prefix, config.init(device)?, device)
    }

    pub fn load_encoder_block<B: Backend>(
        &self,
        prefix: &str,
        config: &BlockConfig,
        device: &B::Device,
    ) -> Result<EncoderBlock<B>, LoadError> {
        self.encoder_block_weights(prefix, config.init_encoder(device)?, device)
    }

    pub fn load_transformer_block<B: Backend>(
        &self,
        prefix: &str,
        config: &BlockConfig,
        device: &B::Device,
    ) -> Result<TransformerBlock<B>, LoadError> {
        let block = config.init_transformer(device)?;
        Ok(TransformerBlock {
            ln1: self.layer_norm(&format!("{prefix}.ln1"), block.ln1, device)?,
            self_attn: self.multi_query_weights(&format!("{prefix}.self_attn"), block.self_attn, device)?,
            ln2: self.layer_norm(&format!("{prefix}.ln2"), block.ln2, device)?,
            cross_attn: self.multi_query_weights(&format!("{prefix}.cross_attn"), block.cross_attn, device)?,
            mlp: self.mlp_weights(&format!("{prefix}.mlp"), block.mlp, device)?,
        })
    }

    pub fn load_multi_axis_transformer_block<B: Backend>(
        &self,
        prefix: &str,
        config: &MultiAxisBlockConfig,
        device: &B::Device,
    ) -> Result<MultiAxisTransformerBlock<B>, LoadError> {
        let block = config.init(device)?;
        Ok(MultiAxisTransformerBlock {
            ln1: self.layer_norm(&format!("{prefix}.ln1"), block.ln1, device)?,
            self_attn: self.multi_axis_weights(&format!("{prefix}.self_attn"), block.self_attn, device)?,
            ln2: self.layer_norm(&format!("{prefix}.ln2"), block.ln2, device)?,
            cross_attn: self.multi_query_weights(&format!("{prefix}.cross_attn"), block.cross_attn, device)?,
            mlp: self.mlp_weights(&format!("{prefix}.mlp"), block.mlp, device)?,
        })
    }

    /// Load a [`TokenEncoder`]
    ///
    /// Reads `token_embedding.weight` `[vocab, d]`, `position_embedding`
    /// `[context_length, d]`, `layers.{i}.*` and `final_norm.*`; an empty
    /// `prefix` addresses the root of the file.
    pub fn load_token_encoder<B: Backend>(
        &self,
        prefix: &str,
        config: &TokenEncoderConfig,
        device: &B::Device,
    ) -> Result<TokenEncoder<B>, LoadError> {
        let key = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            }
        };

        let mut encoder = config.init::<B>(device)?;

        let token_embedding = self.file.load_f32_checked(
            &key("token_embedding.weight"),
            [config.vocab_size, config.emb_dim],
            device,
        )?;
        encoder.token_embedding.weight = Param::from_tensor(token_embedding);

        let position_embedding = self.file.load_f32_checked(
            &key("position_embedding"),
            [config.context_length, config.emb_dim],
            device,
        )?;
        encoder.position_embedding = Param::from_tensor(position_embedding);

        encoder.layers = encoder
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, block)| self.encoder_block_weights(&key(&format!("layers.{i}")), block, device))
            .collect::<Result<Vec<_>, _>>()?;

        encoder.final_norm = self.layer_norm(&key("final_norm"), encoder.final_norm, device)?;

        tracing::info!(
            layers = config.num_layers,
            emb_dim = config.emb_dim,
            "loaded token encoder weights"
        );
        Ok(encoder)
    }
}
