//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use burn_muse_core::LayerError;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid layer configuration: {0}")]
    Layer(#[from] LayerError),

    #[error("Pretrained encoder not found: {0}")]
    NotFound(String),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype for {tensor}: {dtype:?}")]
    UnsupportedDtype { tensor: String, dtype: Dtype },

    #[error("Shape mismatch for {tensor}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// A memory-mapped safetensors file
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    /// Byte range inside the mapping
    start: usize,
    end: usize,
}

impl SafeTensorFile {
    /// Open a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // Safety: the mapping is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let tensors = {
            let st = SafeTensors::deserialize(&mmap)?;
            let base = mmap.as_ptr() as usize;
            st.tensors()
                .into_iter()
                .map(|(name, view)| {
                    let start = view.data().as_ptr() as usize - base;
                    let info = TensorInfo {
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                        start,
                        end: start + view.data().len(),
                    };
                    (name, info)
                })
                .collect()
        };

        tracing::debug!(path = %path.display(), "opened safetensors file");
        Ok(Self { mmap, tensors })
    }

    /// List all tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    /// Check if a tensor exists
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get tensor shape
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Load a tensor as f32, converting from f16/bf16 if needed
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        if info.shape.len() != D {
            return Err(LoadError::ShapeMismatch {
                tensor: name.to_string(),
                expected: vec![0; D],
                actual: info.shape.clone(),
            });
        }

        let data = &self.mmap[info.start..info.end];

        // Byte-wise decoding tolerates unaligned tensor data
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            dtype => {
                return Err(LoadError::UnsupportedDtype {
                    tensor: name.to_string(),
                    dtype,
                })
            }
        };

        let tensor_data = TensorData::new(floats, info.shape.clone());
        Ok(Tensor::from_data(tensor_data, device))
    }

    /// Load a tensor and check its shape
    pub fn load_f32_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected_shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let actual = self
            .shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        if actual != expected_shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                tensor: name.to_string(),
                expected: expected_shape.to_vec(),
                actual: actual.to_vec(),
            });
        }

        self.load_f32::<B, D>(name, device)
    }
}
