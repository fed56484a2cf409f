//! Text-conditioned image blocks driven end to end on the CPU backend
//!
//! Run with: `cargo test -p burn-muse-core --test pipeline`

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_muse_core::{
    get_text_encoder, unblock_image, AttentionStrategy, MultiAxisBlockConfig,
    MultiAxisTransformerBlock, PretrainedLoader, TokenEncoder, TokenEncoderConfig,
};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;

const CHANNELS: usize = 24;

#[derive(Debug, thiserror::Error)]
#[error("unknown encoder {0}")]
struct UnknownEncoder(String);

struct InMemoryLoader;

impl<B: Backend> PretrainedLoader<B> for InMemoryLoader {
    type Encoder = TokenEncoder<B>;
    type Error = UnknownEncoder;

    fn load(&self, identifier: &str, device: &B::Device) -> Result<TokenEncoder<B>, UnknownEncoder> {
        match identifier {
            "tiny" => Ok(TokenEncoderConfig::new(32, CHANNELS, 4, 1, 8)
                .init(device)
                .map_err(|e| UnknownEncoder(e.to_string()))?),
            other => Err(UnknownEncoder(other.to_string())),
        }
    }
}

fn block(strategy: AttentionStrategy) -> MultiAxisTransformerBlock<TestBackend> {
    MultiAxisBlockConfig::new(CHANNELS, 2, 4, 0.0)
        .with_strategy(strategy)
        .init(&Default::default())
        .unwrap()
}

fn image(side: usize) -> Tensor<TestBackend, 4> {
    Tensor::random(
        [2, CHANNELS, side, side],
        Distribution::Normal(0.0, 1.0),
        &Default::default(),
    )
}

#[test]
fn text_conditioned_blocks_stack() {
    let device = Default::default();
    let encoder = get_text_encoder::<TestBackend, _>(&InMemoryLoader, "tiny", &device).unwrap();
    let context = encoder.encode(Tensor::from_ints([[1, 2, 3], [4, 5, 6]], &device));
    assert_eq!(context.dims(), [2, 3, CHANNELS]);

    let first = block(AttentionStrategy::Explicit);
    let second = block(AttentionStrategy::Explicit);

    let hidden = first.forward(image(8), context.clone()).unwrap();
    assert_eq!(hidden.dims(), [2, 16, 4, CHANNELS]);

    // Back to image layout for the next block
    let img = unblock_image(hidden, 2).unwrap();
    assert_eq!(img.dims(), [2, CHANNELS, 8, 8]);

    let out = second.forward(img, context).unwrap();
    assert_eq!(out.dims(), [2, 16, 4, CHANNELS]);
}

#[test]
fn block_kernels_agree() {
    let explicit = block(AttentionStrategy::Explicit);

    let img = image(6);
    let context = Tensor::random([2, 5, CHANNELS], Distribution::Normal(0.0, 1.0), &Default::default());
    let expected = explicit.forward(img.clone(), context.clone()).unwrap();

    for strategy in [AttentionStrategy::Fused, AttentionStrategy::Tiled { chunk_size: 3 }] {
        let mut other = explicit.clone();
        other.self_attn.strategy = strategy;
        other.cross_attn.strategy = strategy;

        let out = other.forward(img.clone(), context.clone()).unwrap();
        let diff: f32 = (expected.clone() - out).abs().max().into_scalar();
        assert!(diff < 1e-4, "{strategy} block differs by {diff}");
    }
}

#[test]
fn unknown_encoder_error_is_unchanged() {
    let device = Default::default();
    let err = get_text_encoder::<TestBackend, _>(&InMemoryLoader, "t5-xxl", &device).unwrap_err();
    assert_eq!(err.to_string(), "unknown encoder t5-xxl");
}
