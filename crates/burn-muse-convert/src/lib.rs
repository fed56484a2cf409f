//! Weight Loading
//!
//! Loads burn-muse layers and text encoders from safetensors files written
//! with PyTorch parameter names.
//!
//! ```ignore
//! use burn_muse_convert::MuseWeightLoader;
//! use burn_muse_core::BlockConfig;
//!
//! let loader = MuseWeightLoader::open("model.safetensors")?;
//! let block = loader.load_transformer_block::<MyBackend>(
//!     "blocks.0",
//!     &BlockConfig::new(512, 8, 0.0),
//!     &device,
//! )?;
//! ```
//!
//! # Pretrained Text Encoders
//!
//! [`SafeTensorsLoader`] plugs into [`burn_muse_core::get_text_encoder`]:
//!
//! ```ignore
//! let encoder = get_text_encoder::<MyBackend, _>(&SafeTensorsLoader::new(), "encoder/", &device)?;
//! let context = encoder.encode(tokens);
//! ```

pub mod loader;
pub mod pretrained;
pub mod weights;

pub use loader::{LoadError, SafeTensorFile};
pub use pretrained::SafeTensorsLoader;
pub use weights::MuseWeightLoader;
