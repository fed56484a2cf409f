//! Multi-axis image attention
//!
//! The image is cut into non-overlapping `k x k` patches and attention runs on
//! two axes at once by splitting the heads in half:
//!
//! ```text
//! heads[..h/2]  dilated   attend across patches at the same pixel offset
//! heads[h/2..]  regional  attend across the pixels of one patch
//! ```
//!
//! Both groups cost the same as windowed attention but together give every
//! pixel a local and a global receptive field in one layer.
//!
//! # Layout
//!
//! ```text
//! image   [batch, c, H, W]
//! blocks  [batch, n, p, c]          n = (H/k) * (W/k), p = k * k
//! heads   [batch, h, n, p, c/h]
//! dilated [batch, h/2, p, n, c/h]   n and p swapped
//! ```
//!
//! # References
//!
//! - [MaxViT: Multi-Axis Vision Transformer](https://arxiv.org/abs/2204.01697)

use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;

use crate::attention::{AttentionStrategy, ScaledDotProduct};
use crate::error::LayerError;

/// Checks that `[.., .., height, width]` can be cut into `block_size` patches
pub fn check_image_blocks(
    height: usize,
    width: usize,
    block_size: usize,
) -> Result<(), LayerError> {
    if block_size == 0 {
        return Err(LayerError::ZeroBlockSize);
    }
    if height != width {
        return Err(LayerError::NonSquareImage { height, width });
    }
    if height % block_size != 0 {
        return Err(LayerError::BlockSizeMismatch {
            side: height,
            block_size,
        });
    }
    Ok(())
}

/// Cuts an image into non-overlapping square patches
///
/// Patch `(gy, gx)` lands at index `gy * (W / k) + gx`, and pixel `(y, x)`
/// inside it at index `y * k + x`, which is the order of an unfold with
/// stride equal to the kernel.
///
/// # Arguments
///
/// * `img` - Image `[batch, channels, height, width]`
/// * `block_size` - Patch side `k`
///
/// # Returns
///
/// Blocks `[batch, num_patches, k * k, channels]`
pub fn block_image<B: Backend>(
    img: Tensor<B, 4>,
    block_size: usize,
) -> Result<Tensor<B, 4>, LayerError> {
    let [batch, channels, height, width] = img.dims();
    check_image_blocks(height, width, block_size)?;

    let (gh, gw) = (height / block_size, width / block_size);

    // [B, C, gh, k, gw, k] -> [B, gh, gw, k, k, C]
    let blocks = img
        .reshape([batch, channels, gh, block_size, gw, block_size])
        .permute([0, 2, 4, 3, 5, 1])
        .reshape([batch, gh * gw, block_size * block_size, channels]);

    Ok(blocks)
}

/// Inverse of [`block_image`]
///
/// # Arguments
///
/// * `blocks` - Blocks `[batch, num_patches, k * k, channels]` of a square image
/// * `block_size` - Patch side `k`
///
/// # Returns
///
/// Image `[batch, channels, height, width]`
pub fn unblock_image<B: Backend>(
    blocks: Tensor<B, 4>,
    block_size: usize,
) -> Result<Tensor<B, 4>, LayerError> {
    let [batch, patches, pixels, channels] = blocks.dims();
    if block_size == 0 {
        return Err(LayerError::ZeroBlockSize);
    }

    let grid = (patches as f64).sqrt().round() as usize;
    if grid * grid != patches || pixels != block_size * block_size {
        return Err(LayerError::PatchLayout {
            patches,
            pixels,
            block_size,
        });
    }
    let side = grid * block_size;

    // [B, gh, gw, k, k, C] -> [B, C, gh, k, gw, k]
    let img = blocks
        .reshape([batch, grid, grid, block_size, block_size, channels])
        .permute([0, 5, 1, 3, 2, 4])
        .reshape([batch, channels, side, side]);

    Ok(img)
}

/// Query/key/value tensors split into the two attention axes
#[derive(Debug, Clone)]
pub struct AxisSplit<B: Backend> {
    /// First half of the heads, `[batch, h/2, p, n, c]`
    pub dilated: [Tensor<B, 5>; 3],
    /// Second half of the heads, `[batch, h - h/2, n, p, c]`
    pub regional: [Tensor<B, 5>; 3],
}

/// Splits `[batch, h, n, p, c]` queries, keys and values along the head axis
///
/// The first `h/2` heads get their patch and pixel axes swapped, so attention
/// over the last two axes runs across patches instead of within one.
///
/// # Panics
///
/// If the head count is odd.
pub fn axis_split<B: Backend>(
    q: Tensor<B, 5>,
    k: Tensor<B, 5>,
    v: Tensor<B, 5>,
) -> AxisSplit<B> {
    let heads = q.dims()[1];
    assert!(
        heads % 2 == 0,
        "axis splitting needs an even head count, got {heads}"
    );
    let half = heads / 2;

    let split = |t: Tensor<B, 5>| {
        let dilated = t.clone().narrow(1, 0, half).swap_dims(2, 3);
        let regional = t.narrow(1, half, heads - half);
        (dilated, regional)
    };

    let (q1, q2) = split(q);
    let (k1, k2) = split(k);
    let (v1, v2) = split(v);

    AxisSplit {
        dilated: [q1, k1, v1],
        regional: [q2, k2, v2],
    }
}

/// Recombines the two head groups into `[batch, h, n, p, c]`
pub fn axis_merge<B: Backend>(dilated: Tensor<B, 5>, regional: Tensor<B, 5>) -> Tensor<B, 5> {
    Tensor::cat(vec![dilated.swap_dims(2, 3), regional], 1)
}

impl<B: Backend> AxisSplit<B> {
    /// Runs `attention` on each group and merges the results
    ///
    /// The groups are attended separately because their shapes differ unless
    /// the patch count equals the patch size.
    pub fn attend<A: ScaledDotProduct>(self, attention: &A, dropout: &Dropout) -> Tensor<B, 5> {
        let [q1, k1, v1] = self.dilated;
        let [q2, k2, v2] = self.regional;

        let dilated = attention.attend(q1, k1, v1, dropout);
        let regional = attention.attend(q2, k2, v2, dropout);

        axis_merge(dilated, regional)
    }
}

/// Multi-axis self-attention over image patches
#[derive(Module, Debug)]
pub struct MultiAxisAttention<B: Backend> {
    /// Fused query/key/value projection `c -> 3c`
    pub to_qkv: Linear<B>,
    pub attn_dropout: Dropout,
    #[module(skip)]
    pub num_heads: usize,
    #[module(skip)]
    pub head_dim: usize,
    #[module(skip)]
    pub block_size: usize,
    #[module(skip)]
    pub strategy: AttentionStrategy,
}

/// Configuration for [`MultiAxisAttention`]
#[derive(Debug, Clone)]
pub struct MultiAxisAttentionConfig {
    /// Channel count `c`
    pub channels: usize,
    /// Patch side `k`
    pub block_size: usize,
    /// Number of heads, split evenly between the two axes
    pub num_heads: usize,
    /// Dropout rate on attention weights (training only)
    pub dropout: f64,
    /// Attention kernel
    pub strategy: AttentionStrategy,
}

impl MultiAxisAttentionConfig {
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

    /// Initializes the attention module
    ///
    /// Fails on a zero block size, on channels not divisible by the head
    /// count, or on an odd head count.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<MultiAxisAttention<B>, LayerError> {
        if self.block_size == 0 {
            return Err(LayerError::ZeroBlockSize);
        }
        if self.num_heads == 0 || self.channels % self.num_heads != 0 {
            return Err(LayerError::HeadsNotDivisible {
                dim: self.channels,
                heads: self.num_heads,
            });
        }
        if self.num_heads % 2 != 0 {
            return Err(LayerError::OddHeadCount {
                heads: self.num_heads,
            });
        }

        tracing::debug!(
            channels = self.channels,
            block_size = self.block_size,
            num_heads = self.num_heads,
            strategy = ?self.strategy,
            "init multi-axis attention"
        );

        Ok(MultiAxisAttention {
            to_qkv: LinearConfig::new(self.channels, 3 * self.channels)
                .with_bias(false)
                .init(device),
            attn_dropout: DropoutConfig::new(self.dropout).init(),
            num_heads: self.num_heads,
            head_dim: self.channels / self.num_heads,
            block_size: self.block_size,
            strategy: self.strategy,
        })
    }
}

impl<B: Backend> MultiAxisAttention<B> {
    /// Channel count `c`
    pub fn channels(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Query scale `head_dim^-0.5`
    pub fn scale(&self) -> f64 {
        (self.head_dim as f64).powf(-0.5)
    }

    /// Attends over an image
    ///
    /// # Arguments
    ///
    /// * `img` - Square image `[batch, c, side, side]`, side divisible by the
    ///   block size
    ///
    /// # Returns
    ///
    /// Blocked output `[batch, n, p, c]`
    pub fn forward(&self, img: Tensor<B, 4>) -> Result<Tensor<B, 4>, LayerError> {
        let blocks = block_image(img, self.block_size)?;
        Ok(self.forward_blocks(blocks))
    }

    /// Attends over already blocked tokens `[batch, n, p, c]`
    ///
    /// The merged heads are returned as is; there is no output projection.
    pub fn forward_blocks(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, patches, pixels, channels] = x.dims();
        let (heads, head_dim) = (self.num_heads, self.head_dim);

        let qkv = self.to_qkv.forward(x);
        // [batch, n, p, h * c] -> [batch, h, n, p, c]
        let to_heads = |t: Tensor<B, 4>| {
            t.reshape([batch, patches, pixels, heads, head_dim])
                .permute([0, 3, 1, 2, 4])
        };

        let q = to_heads(qkv.clone().narrow(3, 0, channels)) * self.scale();
        let k = to_heads(qkv.clone().narrow(3, channels, channels));
        let v = to_heads(qkv.narrow(3, 2 * channels, channels));

        let y = axis_split(q, k, v).attend(&self.strategy, &self.attn_dropout);

        // [batch, h, n, p, c] -> [batch, n, p, h * c]
        y.permute([0, 2, 3, 1, 4])
            .reshape([batch, patches, pixels, channels])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::ExplicitAttention;
    use burn::backend::Autodiff;
    use burn::module::AutodiffModule;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TrainBackend = Autodiff<NdArray<f32>>;

    fn max_abs_diff<const D: usize>(a: Tensor<TestBackend, D>, b: Tensor<TestBackend, D>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    fn no_dropout() -> Dropout {
        DropoutConfig::new(0.0).init()
    }

    #[test]
    fn test_block_image_layout() {
        let device = Default::default();
        // 1 channel 4x4 image with pixel value = row * 4 + col
        let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let img = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device)
            .reshape([1, 1, 4, 4]);

        let blocks = block_image(img, 2).unwrap();
        assert_eq!(blocks.dims(), [1, 4, 4, 1]);

        let data: Vec<f32> = blocks.into_data().to_vec().unwrap();
        // patch 0 = top-left, patch 1 = top-right, ...
        assert_eq!(&data[0..4], &[0.0, 1.0, 4.0, 5.0]);
        assert_eq!(&data[4..8], &[2.0, 3.0, 6.0, 7.0]);
        assert_eq!(&data[8..12], &[8.0, 9.0, 12.0, 13.0]);
        assert_eq!(&data[12..16], &[10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn test_block_channels_last() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let blocks = block_image(img.clone(), 4).unwrap();

        // pixel (y=5, x=2) is in patch (1, 0), offset (1, 2)
        let from_img = img.slice([0..2, 0..3, 5..6, 2..3]).reshape([2, 3]);
        let from_blocks = blocks.slice([0..2, 2..3, 6..7, 0..3]).reshape([2, 3]);
        assert_eq!(max_abs_diff(from_img, from_blocks), 0.0);
    }

    #[test]
    fn test_unblock_inverts_block() {
        let device = Default::default();
        let img = Tensor::<TestBackend, 4>::random([2, 3, 12, 12], Distribution::Normal(0.0, 1.0), &device);

        let blocks = block_image(img.clone(), 3).unwrap();
        assert_eq!(blocks.dims(), [2, 16, 9, 3]);
        let back = unblock_image(blocks, 3).unwrap();
        assert_eq!(max_abs_diff(img, back), 0.0);
    }

    #[test]
    fn test_block_rejects_bad_images() {
        let device = Default::default();

        let img = Tensor::<TestBackend, 4>::zeros([1, 2, 17, 17], &device);
        assert_eq!(
            block_image(img, 4).unwrap_err(),
            LayerError::BlockSizeMismatch {
                side: 17,
                block_size: 4
            }
        );

        let img = Tensor::<TestBackend, 4>::zeros([1, 2, 8, 12], &device);
        assert_eq!(
            block_image(img, 4).unwrap_err(),
            LayerError::NonSquareImage {
                height: 8,
                width: 12
            }
        );

        let img = Tensor::<TestBackend, 4>::zeros([1, 2, 8, 8], &device);
        assert_eq!(block_image(img, 0).unwrap_err(), LayerError::ZeroBlockSize);
    }

    #[test]
    fn test_unblock_rejects_bad_layout() {
        let device = Default::default();
        let blocks = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 2], &device);
        assert!(matches!(
            unblock_image(blocks, 2),
            Err(LayerError::PatchLayout { patches: 3, .. })
        ));
    }

    #[test]
    fn test_axis_split_shapes() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 5>::zeros([2, 4, 3, 5, 6], &device);
        let split = axis_split(t.clone(), t.clone(), t);

        for d in &split.dilated {
            assert_eq!(d.dims(), [2, 2, 5, 3, 6]);
        }
        for r in &split.regional {
            assert_eq!(r.dims(), [2, 2, 3, 5, 6]);
        }
    }

    #[test]
    fn test_axis_merge_inverts_split() {
        let device = Default::default();
        let q = Tensor::<TestBackend, 5>::random([1, 4, 3, 5, 2], Distribution::Normal(0.0, 1.0), &device);
        let split = axis_split(q.clone(), q.clone(), q.clone());

        let [dq, _, _] = split.dilated;
        let [rq, _, _] = split.regional;
        assert_eq!(max_abs_diff(axis_merge(dq, rq), q), 0.0);
    }

    #[test]
    #[should_panic(expected = "even head count")]
    fn test_axis_split_odd_heads() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 5>::zeros([1, 3, 2, 2, 2], &device);
        let _ = axis_split(t.clone(), t.clone(), t);
    }

    #[test]
    fn test_split_preserves_constant_values() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 5>::ones([1, 4, 4, 16, 8], &device) * 0.75;

        let unsplit = ExplicitAttention.attend(t.clone(), t.clone(), t.clone(), &no_dropout());
        let split = axis_split(t.clone(), t.clone(), t).attend(&ExplicitAttention, &no_dropout());

        assert_eq!(split.dims(), unsplit.dims());
        assert!(max_abs_diff(split, unsplit) < 1e-6);
    }

    #[test]
    fn test_dilated_and_regional_scopes() {
        let device = Default::default();
        // 2 heads, 2 patches, 2 pixels, head_dim 1
        // zero queries/keys give uniform weights, so outputs are means
        let q = Tensor::<TestBackend, 5>::zeros([1, 2, 2, 2, 1], &device);
        let v = Tensor::<TestBackend, 1>::from_floats(
            [
                // dilated head: [patch][pixel]
                1.0, 2.0, 3.0, 4.0, //
                // regional head
                1.0, 2.0, 3.0, 4.0,
            ],
            &device,
        )
        .reshape([1, 2, 2, 2, 1]);

        let out: Vec<f32> = axis_split(q.clone(), q, v)
            .attend(&ExplicitAttention, &no_dropout())
            .into_data()
            .to_vec()
            .unwrap();

        // dilated: mean over patches at the same pixel -> (1+3)/2, (2+4)/2
        assert_eq!(&out[0..4], &[2.0, 3.0, 2.0, 3.0]);
        // regional: mean over pixels inside the patch -> (1+2)/2, (3+4)/2
        assert_eq!(&out[4..8], &[1.5, 1.5, 3.5, 3.5]);
    }

    #[test]
    fn test_patch_arithmetic() {
        let device = Default::default();
        let attn = MultiAxisAttentionConfig::new(8, 4, 4, 0.0)
            .init::<TestBackend>(&device)
            .unwrap();

        let img = Tensor::<TestBackend, 4>::random([1, 8, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let y = attn.forward(img).unwrap();

        // (8/4)^2 = 4 patches of 4*4 = 16 pixels
        assert_eq!(y.dims(), [1, 4, 16, 8]);
    }

    #[test]
    fn test_forward_rejects_indivisible_side() {
        let device = Default::default();
        let attn = MultiAxisAttentionConfig::new(8, 4, 4, 0.0)
            .init::<TestBackend>(&device)
            .unwrap();

        let img = Tensor::<TestBackend, 4>::zeros([2, 8, 17, 17], &device);
        assert_eq!(
            attn.forward(img).unwrap_err(),
            LayerError::BlockSizeMismatch {
                side: 17,
                block_size: 4
            }
        );
    }

    #[test]
    fn test_config_validation() {
        let device = Default::default();
        assert_eq!(
            MultiAxisAttentionConfig::new(12, 4, 3, 0.0)
                .init::<TestBackend>(&device)
                .unwrap_err(),
            LayerError::OddHeadCount { heads: 3 }
        );
        assert_eq!(
            MultiAxisAttentionConfig::new(10, 4, 4, 0.0)
                .init::<TestBackend>(&device)
                .unwrap_err(),
            LayerError::HeadsNotDivisible { dim: 10, heads: 4 }
        );
    }

    #[test]
    fn test_kernels_agree() {
        let device = Default::default();
        let explicit = MultiAxisAttentionConfig::new(8, 2, 4, 0.0)
            .with_strategy(AttentionStrategy::Explicit)
            .init::<TestBackend>(&device)
            .unwrap();

        // 6x6 with k=2 gives 9 patches of 4 pixels
        let img = Tensor::<TestBackend, 4>::random([2, 8, 6, 6], Distribution::Normal(0.0, 1.0), &device);
        let expected = explicit.forward(img.clone()).unwrap();

        for strategy in [AttentionStrategy::Fused, AttentionStrategy::Tiled { chunk_size: 3 }] {
            let mut attn = explicit.clone();
            attn.strategy = strategy;
            let diff = max_abs_diff(expected.clone(), attn.forward(img.clone()).unwrap());
            assert!(diff < 1e-4, "{strategy}: diff {diff}");
        }
    }

    #[test]
    fn test_output_is_merged_heads() {
        let device = Default::default();
        let attn = MultiAxisAttentionConfig::new(8, 2, 4, 0.0)
            .with_strategy(AttentionStrategy::Explicit)
            .init::<TestBackend>(&device)
            .unwrap();

        let img = Tensor::<TestBackend, 4>::random([1, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let blocks = block_image(img.clone(), 2).unwrap();

        let [b, n, p, c] = blocks.dims();
        let qkv = attn.to_qkv.forward(blocks);
        let heads = |t: Tensor<TestBackend, 4>| t.reshape([b, n, p, 4, 2]).permute([0, 3, 1, 2, 4]);
        let q = heads(qkv.clone().narrow(3, 0, c)) * attn.scale();
        let k = heads(qkv.clone().narrow(3, c, c));
        let v = heads(qkv.narrow(3, 2 * c, c));

        let merged = axis_split(q, k, v)
            .attend(&ExplicitAttention, &no_dropout())
            .permute([0, 2, 3, 1, 4])
            .reshape([b, n, p, c]);

        assert!(max_abs_diff(attn.forward(img).unwrap(), merged) < 1e-6);
    }

    #[test]
    fn test_training_drops_weights_in_both_groups() {
        let device = Default::default();
        let attn = MultiAxisAttentionConfig::new(8, 2, 4, 0.5)
            .with_strategy(AttentionStrategy::Explicit)
            .init::<TrainBackend>(&device)
            .unwrap();

        let img = Tensor::<TrainBackend, 4>::random([1, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let train = attn.forward(img.clone()).unwrap().inner();
        let eval = attn.valid().forward(img.inner()).unwrap();

        // Channels [0, 4) come from the dilated heads, [4, 8) from the regional ones
        let diff = (train - eval).abs();
        let dilated: f32 = diff.clone().narrow(3, 0, 4).max().into_scalar();
        let regional: f32 = diff.narrow(3, 4, 4).max().into_scalar();
        assert!(dilated > 0.0, "dropout missed the dilated heads");
        assert!(regional > 0.0, "dropout missed the regional heads");
    }
}
