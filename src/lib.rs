//! # lora-tune
//!
//! Configuration-driven `LoRA`/`QLoRA` fine-tuning of causal language models.
//!
//! A run loads a pretrained model (optionally quantizing its linear layers to
//! 4 bits), freezes it, injects a low-rank adapter, trains the adapter on a
//! pre-tokenized dataset and publishes the adapter with its tokenizer.
//!
//! ## Features
//!
//! - **YAML Configuration** - One file describes the whole run
//! - **`QLoRA`** - NF4 blockwise quantization of the frozen base weights
//! - **PEFT-compatible output** - `adapter_model.safetensors` + `adapter_config.json`
//! - **Pluggable registries** - Local directories or the Hugging Face hub (`hub` feature)
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a preset, then fill in dataset.repo_id and publish.repo_id
//! lora-tune init run.yaml --preset falcon-7b
//!
//! # Validate configuration
//! lora-tune validate run.yaml
//!
//! # Start training
//! lora-tune train run.yaml --models ./models --datasets ./data --publish-dir ./published
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod cli;
pub mod collator;
pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod publish;
pub mod quantization;
pub mod registry;
pub mod scheduler;
pub mod tokenizer;
pub mod trainer;

pub use adapters::{LoraModel, ParameterSummary};
pub use config::{LoraSettings, RunConfig, TrainerConfig};
pub use dataset::{Dataset, DatasetRegistry, LocalDatasetRegistry, TokenizedRecord};
pub use error::{Result, TuneError};
pub use model::{prepare_model, CausalLm, LoadOptions};
pub use pipeline::{FineTunePipeline, RunSummary};
pub use publish::{ArtifactBundle, ArtifactPublisher, LocalPublisher, PublishReceipt};
pub use registry::{LocalModelRegistry, ModelRegistry};
pub use tokenizer::TextTokenizer;
pub use trainer::Trainer;
