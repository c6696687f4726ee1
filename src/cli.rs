//! Command line interface.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::RunConfig;
use crate::dataset::{DatasetRegistry, LocalDatasetRegistry};
use crate::error::{Result, TuneError};
use crate::pipeline::{FineTunePipeline, RunSummary};
use crate::publish::{ArtifactPublisher, LocalPublisher};
use crate::registry::{LocalModelRegistry, ModelRegistry};

/// Fine-tune causal language models with `LoRA` adapters.
#[derive(Debug, Parser)]
#[command(name = "lora-tune", author, version, about, long_about = None)]
pub struct Cli {
    /// Command to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check a run configuration without loading anything.
    Validate {
        /// YAML configuration file.
        config: PathBuf,
    },

    /// Run a fine-tuning job.
    Train {
        /// YAML configuration file.
        config: PathBuf,

        /// Directory holding `<model>/{config.json, model.safetensors, tokenizer.json}`.
        #[arg(long, env = "LORA_TUNE_MODEL_DIR")]
        models: Option<PathBuf>,

        /// Directory holding `<dataset>/<split>.jsonl`.
        #[arg(long, env = "LORA_TUNE_DATASET_DIR")]
        datasets: Option<PathBuf>,

        /// Directory receiving published artifacts.
        #[arg(long, env = "LORA_TUNE_PUBLISH_DIR")]
        publish_dir: Option<PathBuf>,

        /// Resolve models and datasets on the Hugging Face hub and upload
        /// artifacts over HTTP.
        #[arg(long)]
        hub: bool,

        /// HTTP artifact store receiving uploads with `--hub`.
        #[arg(long, env = "LORA_TUNE_HUB_ENDPOINT")]
        hub_endpoint: Option<String>,

        /// Checkpoint directory to continue from.
        #[arg(long)]
        resume_from: Option<PathBuf>,
    },

    /// Write a preset configuration to a file.
    Init {
        /// Output path.
        path: PathBuf,

        /// Preset name (`falcon-7b`, `toy`).
        #[arg(long, default_value = "falcon-7b")]
        preset: String,
    },
}

/// Execute a parsed command line.
///
/// # Errors
///
/// Returns the first error of the selected command.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Init { path, preset } => init(&path, &preset),
        Commands::Train {
            config,
            models,
            datasets,
            publish_dir,
            hub,
            hub_endpoint,
            resume_from,
        } => {
            let run_config = RunConfig::from_file(&config)?;
            let summary = if hub {
                let endpoint = hub_endpoint.ok_or_else(|| {
                    TuneError::Config("--hub-endpoint is required with --hub".into())
                })?;
                train_hub(&run_config, &endpoint, resume_from)?
            } else {
                let models = require_dir(models, "--models")?;
                let datasets = require_dir(datasets, "--datasets")?;
                let publish_dir = require_dir(publish_dir, "--publish-dir")?;
                train_with(
                    FineTunePipeline::new(
                        LocalModelRegistry::new(models),
                        LocalDatasetRegistry::new(datasets),
                        LocalPublisher::new(publish_dir),
                    ),
                    &run_config,
                    resume_from,
                )?
            };
            tracing::info!(
                "Done: {} steps, loss {:.4}, published to {}",
                summary.train.global_step,
                summary.train.training_loss,
                summary.receipt.location
            );
            Ok(())
        }
    }
}

fn validate(path: &Path) -> Result<()> {
    let config = RunConfig::from_file(path)?;
    config.validate()?;
    tracing::info!("Configuration is valid");
    tracing::info!("  Base model: {}", config.pretrained_model_name);
    tracing::info!(
        "  LoRA: r={} alpha={} targets={:?}",
        config.lora.r,
        config.lora.alpha,
        config.lora.target_modules
    );
    tracing::info!("  Dataset: {} ({})", config.dataset.repo_id, config.dataset.split);
    tracing::info!("  Publish to: {}", config.publish.repo_id);
    Ok(())
}

fn init(path: &Path, preset: &str) -> Result<()> {
    let config = RunConfig::from_preset(preset)?;
    config.to_file(path)?;
    tracing::info!(
        "Wrote {preset} preset to {}; set dataset.repo_id and publish.repo_id before training",
        path.display()
    );
    Ok(())
}

fn require_dir(dir: Option<PathBuf>, flag: &str) -> Result<PathBuf> {
    dir.ok_or_else(|| TuneError::Config(format!("{flag} is required without --hub")))
}

fn train_with<M, D, P>(
    pipeline: FineTunePipeline<M, D, P>,
    config: &RunConfig,
    resume_from: Option<PathBuf>,
) -> Result<RunSummary>
where
    M: ModelRegistry,
    D: DatasetRegistry,
    P: ArtifactPublisher,
{
    pipeline.with_resume_from(resume_from).run(config)
}

#[cfg(feature = "hub")]
fn train_hub(config: &RunConfig, endpoint: &str, resume_from: Option<PathBuf>) -> Result<RunSummary> {
    use crate::dataset::HubDatasetRegistry;
    use crate::publish::HttpPublisher;
    use crate::registry::HubModelRegistry;

    let pipeline = FineTunePipeline::new(
        HubModelRegistry::new(None)?,
        HubDatasetRegistry::new()?,
        HttpPublisher::new(endpoint, std::env::var("HF_TOKEN").ok())?,
    );
    train_with(pipeline, config, resume_from)
}

#[cfg(not(feature = "hub"))]
fn train_hub(
    _config: &RunConfig,
    _endpoint: &str,
    _resume_from: Option<PathBuf>,
) -> Result<RunSummary> {
    Err(TuneError::Config(
        "--hub requires lora-tune to be built with the `hub` feature".into(),
    ))
}
