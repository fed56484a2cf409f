//! Identifier-based text encoder loading
//!
//! An identifier names either a `.safetensors` file, with a `config.json`
//! next to it, or a directory holding `model.safetensors` and `config.json`.
//! Relative identifiers are resolved against the loader's root directory.

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn_muse_core::{PretrainedLoader, TokenEncoder, TokenEncoderConfig};

use crate::loader::LoadError;
use crate::weights::MuseWeightLoader;

const WEIGHTS_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";

/// Loads [`TokenEncoder`]s from safetensors checkpoints on disk
#[derive(Debug, Clone, Default)]
pub struct SafeTensorsLoader {
    root: Option<PathBuf>,
}

impl SafeTensorsLoader {
    /// Resolve identifiers relative to the working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve identifiers relative to `root`
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Find the weight and config files for `identifier`
    pub fn resolve(&self, identifier: &str) -> Result<(PathBuf, PathBuf), LoadError> {
        let path = match &self.root {
            Some(root) => root.join(identifier),
            None => PathBuf::from(identifier),
        };

        let (weights, config) = if path.is_dir() {
            (path.join(WEIGHTS_FILE), path.join(CONFIG_FILE))
        } else if path.extension().is_some_and(|ext| ext == "safetensors") {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            (path.clone(), dir.join(CONFIG_FILE))
        } else {
            return Err(LoadError::NotFound(identifier.to_string()));
        };

        if !weights.is_file() || !config.is_file() {
            return Err(LoadError::NotFound(identifier.to_string()));
        }
        Ok((weights, config))
    }
}

impl<B: Backend> PretrainedLoader<B> for SafeTensorsLoader {
    type Encoder = TokenEncoder<B>;
    type Error = LoadError;

    fn load(&self, identifier: &str, device: &B::Device) -> Result<TokenEncoder<B>, LoadError> {
        let (weights, config) = self.resolve(identifier)?;
        tracing::info!(identifier, weights = %weights.display(), "loading text encoder");

        let config: TokenEncoderConfig = serde_json::from_str(&fs::read_to_string(config)?)?;
        MuseWeightLoader::open(weights)?.load_token_encoder("", &config, device)
    }
}
