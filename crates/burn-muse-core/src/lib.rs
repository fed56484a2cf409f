//! Attention Layers for Text-Conditioned Image Transformers
//!
//! Building blocks of a masked image generator that attends over image
//! patches and cross-attends to frozen text-encoder output.
//!
//! # Modules
//!
//! ## Attention
//!
//! - [`attention`] - Scaled dot-product kernels (backend primitive, explicit, tiled)
//! - [`multi_query`] - Multi-query attention (one shared KV head)
//! - [`multi_axis`] - Patch blocking, axis splitting, multi-axis attention
//!
//! ## Feed-Forward and Normalization
//!
//! - [`glu`] - GEGLU activation and the gated MLP
//! - [`layernorm`] - Layer normalization
//!
//! ## Blocks
//!
//! - [`blocks`] - Encoder, transformer and multi-axis transformer blocks
//! - [`text_encoder`] - Frozen text encoder access
//!
//! # Example
//!
//! ```ignore
//! use burn_muse_core::blocks::MultiAxisBlockConfig;
//!
//! let block = MultiAxisBlockConfig::new(256, 8, 8, 0.1).init::<Backend>(&device)?;
//!
//! // image [batch, 256, 64, 64], text [batch, seq, 256]
//! let hidden = block.forward(image, text)?; // [batch, 64, 64, 256]
//! ```

pub mod attention;
pub mod blocks;
pub mod error;
pub mod glu;
pub mod layernorm;
pub mod multi_axis;
pub mod multi_query;
pub mod text_encoder;

pub use attention::{
    AttentionStrategy, ExplicitAttention, FusedAttention, ScaledDotProduct, TiledAttention,
};
pub use blocks::{
    BlockConfig, EncoderBlock, MultiAxisBlockConfig, MultiAxisTransformerBlock, TransformerBlock,
};
pub use error::LayerError;
pub use glu::{geglu, gelu_tanh, Mlp, MlpConfig};
pub use layernorm::LayerNorm;
pub use multi_axis::{
    axis_merge, axis_split, block_image, unblock_image, AxisSplit, MultiAxisAttention,
    MultiAxisAttentionConfig,
};
pub use multi_query::{MultiQueryAttention, MultiQueryAttentionConfig};
pub use text_encoder::{
    get_text_encoder, FrozenTextEncoder, PretrainedLoader, TextEncoder, TokenEncoder,
    TokenEncoderConfig,
};
