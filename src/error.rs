//! Error types for lora-tune.

use thiserror::Error;

/// Result type alias for lora-tune operations.
pub type Result<T> = std::result::Result<T, TuneError>;

/// Errors that can occur in lora-tune.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TuneError {
    /// Model or tokenizer could not be resolved by the registry.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Dataset or split could not be resolved by the registry.
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Artifact upload failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Invalid JSON document (model config, dataset row, trainer state).
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Model loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// PEFT error.
    #[error("PEFT error: {0}")]
    Peft(#[from] peft_rs::PeftError),

    /// `QLoRA` error.
    #[error("QLoRA error: {0}")]
    Qlora(#[from] qlora_rs::QLoraError),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),

    /// Other errors.
    #[error("{0}")]
    Other(String),
}
