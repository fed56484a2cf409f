//! Layer normalization over the channel (last) axis
//!
//! Used in front of every attention and MLP branch. Works on any rank, so the
//! same module normalizes flattened tokens `[batch, seq, d]` and blocked image
//! tokens `[batch, patches, pixels, c]`.

use burn::module::Param;
use burn::prelude::*;

/// Default epsilon, matching PyTorch's `nn.LayerNorm`
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Layer normalization module
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
///
/// `var` is the biased (population) variance.
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter
    pub weight: Param<Tensor<B, 1>>,
    /// Shift parameter
    pub bias: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Creates an identity-initialized layer norm over `size` channels
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self::with_eps(size, LAYER_NORM_EPS, device)
    }

    /// Creates a layer norm with a custom epsilon
    pub fn with_eps(size: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([size], device)),
            bias: Param::from_tensor(Tensor::zeros([size], device)),
            eps,
        }
    }

    /// Creates layer norm from pre-loaded weight and bias
    pub fn from_weight_bias(weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            eps: LAYER_NORM_EPS,
        }
    }

    /// Number of normalized channels
    pub fn size(&self) -> usize {
        let [size] = self.weight.dims();
        size
    }

    /// Normalizes `x` across its last dimension
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let var = x.clone().var_bias(last_dim);

        let x_norm = (x - mean) / (var + self.eps).sqrt();

        x_norm * self.weight.val().unsqueeze() + self.bias.val().unsqueeze()
    }
}
