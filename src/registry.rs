//! Model and tokenizer registries.
//!
//! A registry resolves a pretrained model name into a loaded [`CausalLm`] and
//! its [`TextTokenizer`]. [`LocalModelRegistry`] reads directories laid out as
//! `<root>/<name>/{config.json, model.safetensors, tokenizer.json}`;
//! `HubModelRegistry` (feature `hub`) downloads the same files from the
//! Hugging Face hub first.

use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::error::{Result, TuneError};
use crate::model::{CausalLm, LoadOptions, CONFIG_FILENAME, WEIGHTS_FILENAME};
use crate::tokenizer::{TextTokenizer, TOKENIZER_FILENAME};

/// Source of pretrained models and tokenizers.
pub trait ModelRegistry {
    /// Load the tokenizer published with `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::ResourceNotFound`] if `name` cannot be resolved.
    fn load_tokenizer(&self, name: &str) -> Result<TextTokenizer>;

    /// Load the model weights published as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::ResourceNotFound`] if `name` cannot be resolved.
    fn load_model(&self, name: &str, options: &LoadOptions, device: &Device) -> Result<CausalLm>;
}

/// Models stored as directories under a root.
#[derive(Debug, Clone)]
pub struct LocalModelRegistry {
    root: PathBuf,
}

impl LocalModelRegistry {
    /// Create a registry rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str, required: &[&str]) -> Result<PathBuf> {
        let dir = self.root.join(name);
        for file in required {
            if !dir.join(file).is_file() {
                return Err(TuneError::ResourceNotFound(format!(
                    "{name}: {file} not found under {}",
                    self.root.display()
                )));
            }
        }
        Ok(dir)
    }
}

impl ModelRegistry for LocalModelRegistry {
    fn load_tokenizer(&self, name: &str) -> Result<TextTokenizer> {
        let dir = self.resolve(name, &[TOKENIZER_FILENAME])?;
        TextTokenizer::from_dir(&dir)
    }

    fn load_model(&self, name: &str, options: &LoadOptions, device: &Device) -> Result<CausalLm> {
        let dir = self.resolve(name, &[CONFIG_FILENAME, WEIGHTS_FILENAME])?;
        CausalLm::from_pretrained(&dir, options, device)
    }
}

#[cfg(feature = "hub")]
pub use hub::HubModelRegistry;

#[cfg(feature = "hub")]
mod hub {
    use std::path::PathBuf;

    use candle_core::Device;
    use hf_hub::api::sync::{Api, ApiBuilder};

    use super::ModelRegistry;
    use crate::error::{Result, TuneError};
    use crate::model::{CausalLm, LoadOptions, CONFIG_FILENAME, WEIGHTS_FILENAME};
    use crate::tokenizer::{TextTokenizer, TOKENIZER_CONFIG_FILENAME, TOKENIZER_FILENAME};

    /// Models downloaded from the Hugging Face hub into the local cache.
    pub struct HubModelRegistry {
        api: Api,
    }

    impl HubModelRegistry {
        /// Create a registry using `HF_TOKEN` and the default cache.
        ///
        /// # Errors
        ///
        /// Returns an error if the hub client cannot be built.
        pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
            let mut builder = ApiBuilder::new().with_token(std::env::var("HF_TOKEN").ok());
            if let Some(dir) = cache_dir {
                builder = builder.with_cache_dir(dir);
            }
            let api = builder
                .build()
                .map_err(|e| TuneError::Other(format!("hub client: {e}")))?;
            Ok(Self { api })
        }

        /// Download `file` from model repository `name`.
        fn fetch(&self, name: &str, file: &str) -> Result<PathBuf> {
            tracing::debug!("Fetching {file} from {name}");
            self.api
                .model(name.to_string())
                .get(file)
                .map_err(|e| TuneError::ResourceNotFound(format!("{name}/{file}: {e}")))
        }
    }

    impl ModelRegistry for HubModelRegistry {
        fn load_tokenizer(&self, name: &str) -> Result<TextTokenizer> {
            let path = self.fetch(name, TOKENIZER_FILENAME)?;
            // Optional; absent on many repositories.
            if let Err(e) = self.fetch(name, TOKENIZER_CONFIG_FILENAME) {
                tracing::debug!("No {TOKENIZER_CONFIG_FILENAME} for {name}: {e}");
            }
            let dir = path
                .parent()
                .ok_or_else(|| TuneError::Other(format!("bad cache path {}", path.display())))?;
            TextTokenizer::from_dir(dir)
        }

        fn load_model(
            &self,
            name: &str,
            options: &LoadOptions,
            device: &Device,
        ) -> Result<CausalLm> {
            self.fetch(name, CONFIG_FILENAME)?;
            let weights = self.fetch(name, WEIGHTS_FILENAME)?;
            let dir = weights
                .parent()
                .ok_or_else(|| TuneError::Other(format!("bad cache path {}", weights.display())))?;
            CausalLm::from_pretrained(dir, options, device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{toy_config, toy_tensors};
    use crate::tokenizer::tests::word_level_json;
    use tempfile::TempDir;

    fn write_toy_model(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let config = toy_config();
        std::fs::write(
            dir.join(CONFIG_FILENAME),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();
        candle_core::safetensors::save(&toy_tensors(&config), dir.join(WEIGHTS_FILENAME)).unwrap();
        std::fs::write(dir.join(TOKENIZER_FILENAME), word_level_json()).unwrap();
    }

    #[test]
    fn test_local_registry_loads_model_and_tokenizer() {
        let root = TempDir::new().unwrap();
        write_toy_model(root.path(), "org/toy-model");
        let registry = LocalModelRegistry::new(root.path());

        let tokenizer = registry.load_tokenizer("org/toy-model").unwrap();
        assert_eq!(tokenizer.vocab_size(), 16);

        let options = LoadOptions {
            use_cache: false,
            ..Default::default()
        };
        let model = registry
            .load_model("org/toy-model", &options, &Device::Cpu)
            .unwrap();
        assert!(!model.use_cache());
    }

    #[test]
    fn test_unknown_model_is_resource_not_found() {
        let root = TempDir::new().unwrap();
        let registry = LocalModelRegistry::new(root.path());

        let err = registry.load_tokenizer("missing").unwrap_err();
        assert!(matches!(err, TuneError::ResourceNotFound(_)));

        let err = registry
            .load_model("missing", &LoadOptions::default(), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, TuneError::ResourceNotFound(_)));
    }

    #[test]
    fn test_missing_weights_is_resource_not_found() {
        let root = TempDir::new().unwrap();
        write_toy_model(root.path(), "toy");
        std::fs::remove_file(root.path().join("toy").join(WEIGHTS_FILENAME)).unwrap();
        let registry = LocalModelRegistry::new(root.path());

        let err = registry
            .load_model("toy", &LoadOptions::default(), &Device::Cpu)
            .unwrap_err();
        assert!(err.to_string().contains(WEIGHTS_FILENAME));
    }
}
