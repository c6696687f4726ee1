//! End-to-end fine-tuning run.
//!
//! [`FineTunePipeline::run`] loads the tokenizer and base model, prepares the
//! model for adapter training, injects a `LoRA` adapter, trains it on a
//! tokenized dataset split and publishes the adapter together with the
//! tokenizer. Steps run strictly in order and the first failure ends the run.

use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::adapters::{LoraModel, ParameterSummary, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME};
use crate::collator::DataCollator;
use crate::config::RunConfig;
use crate::dataset::{Dataset, DatasetRegistry};
use crate::error::{Result, TuneError};
use crate::model::{prepare_model, LoadOptions};
use crate::publish::{ArtifactBundle, ArtifactPublisher, PublishReceipt};
use crate::registry::ModelRegistry;
use crate::tokenizer::{TOKENIZER_CONFIG_FILENAME, TOKENIZER_FILENAME};
use crate::trainer::{TrainOutput, Trainer};

/// Diagnostics of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Trainable-parameter report after adapter injection.
    pub parameters: ParameterSummary,
    /// Rows in the training split.
    pub num_rows: usize,
    /// Approximate token count of the training split.
    pub token_volume: usize,
    /// Result of the training loop.
    pub train: TrainOutput,
    /// Where the artifacts went.
    pub receipt: PublishReceipt,
}

/// Orchestrates one fine-tuning run against pluggable registries.
pub struct FineTunePipeline<M, D, P> {
    models: M,
    datasets: D,
    publisher: P,
    device: Device,
    resume_from: Option<PathBuf>,
}

impl<M, D, P> FineTunePipeline<M, D, P>
where
    M: ModelRegistry,
    D: DatasetRegistry,
    P: ArtifactPublisher,
{
    /// Pipeline running on the CPU.
    pub fn new(models: M, datasets: D, publisher: P) -> Self {
        Self {
            models,
            datasets,
            publisher,
            device: Device::Cpu,
            resume_from: None,
        }
    }

    /// Run on `device` instead.
    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Continue training from a checkpoint directory.
    #[must_use]
    pub fn with_resume_from(mut self, checkpoint: Option<PathBuf>) -> Self {
        self.resume_from = checkpoint;
        self
    }

    /// Model registry.
    pub fn models(&self) -> &M {
        &self.models
    }

    /// Dataset registry.
    pub fn datasets(&self) -> &D {
        &self.datasets
    }

    /// Artifact publisher.
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Execute the run described by `config`.
    ///
    /// # Errors
    ///
    /// - [`TuneError::Config`] for an invalid configuration or unmatched
    ///   target modules.
    /// - [`TuneError::ResourceNotFound`] if the model or tokenizer cannot be
    ///   resolved.
    /// - [`TuneError::DatasetNotFound`] if the dataset split cannot be
    ///   resolved.
    /// - [`TuneError::Publish`] if publishing fails.
    /// - Any model, training or IO error from the steps in between.
    pub fn run(&self, config: &RunConfig) -> Result<RunSummary> {
        config.validate()?;
        let name = &config.pretrained_model_name;

        tracing::info!("Loading tokenizer and model: {name}");
        let mut tokenizer = self.models.load_tokenizer(name)?;
        let options = LoadOptions::for_run(config);
        let mut model = self.models.load_model(name, &options, &self.device)?;
        tracing::info!(
            "Loaded {} parameters (use_cache={})",
            model.num_parameters(),
            model.use_cache()
        );

        let pad_token_id = tokenizer.set_pad_to_eos(model.config().eos_token_id)?;
        tracing::debug!("Padding with token id {pad_token_id}");

        prepare_model(&mut model, config.gradient_checkpointing)?;

        let vocab_size = model.config().vocab_size;
        let model = LoraModel::inject(model, &config.lora, name)?;
        let parameters = model.print_trainable_parameters();

        let dataset = self.datasets.load(&config.dataset)?;
        tracing::info!("{dataset}");
        tracing::info!("Training on {} tokens", dataset.token_volume());
        check_token_ids(&dataset, vocab_size)?;
        let num_rows = dataset.num_rows();
        let token_volume = dataset.token_volume();

        let collator = if config.masked_language_modeling {
            DataCollator::masked(
                pad_token_id,
                vocab_size,
                tokenizer.mask_token_id(),
                config.mlm_probability,
            )?
            .with_special_tokens(tokenizer.special_token_ids())
        } else {
            DataCollator::causal(pad_token_id, vocab_size)
        };
        let mut trainer = Trainer::new(model, dataset, config.trainer.clone(), collator, config.seed)?;
        if let Some(checkpoint) = &self.resume_from {
            trainer.resume_from(checkpoint)?;
        }
        let train = trainer.train()?;
        let model = trainer.into_model();

        let output_dir = Path::new(&config.trainer.output_dir);
        model.save_pretrained(output_dir)?;
        tokenizer.save(output_dir)?;
        let bundle = ArtifactBundle::new(
            output_dir,
            [
                ADAPTER_WEIGHTS_FILENAME,
                ADAPTER_CONFIG_FILENAME,
                TOKENIZER_FILENAME,
                TOKENIZER_CONFIG_FILENAME,
            ]
            .iter()
            .map(|f| (*f).to_string())
            .collect(),
        )?;

        tracing::info!("Publishing to {}", config.publish.repo_id);
        let receipt = self.publisher.publish(&config.publish.repo_id, &bundle)?;
        tracing::info!("Published {} files to {}", receipt.files.len(), receipt.location);

        Ok(RunSummary {
            parameters,
            num_rows,
            token_volume,
            train,
            receipt,
        })
    }
}

fn check_token_ids(dataset: &Dataset, vocab_size: usize) -> Result<()> {
    for (row, record) in dataset.rows().iter().enumerate() {
        if let Some(id) = record
            .input_ids
            .iter()
            .find(|&&id| usize::try_from(id).map_or(true, |id| id >= vocab_size))
        {
            return Err(TuneError::Dataset(format!(
                "row {row}: token id {id} outside vocabulary of {vocab_size}"
            )));
        }
    }
    Ok(())
}
