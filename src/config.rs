//! Run configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

/// Configuration for a single fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Base model identifier, resolved by the model registry.
    #[serde(alias = "base_model")]
    pub pretrained_model_name: String,

    /// Trade recomputation for activation memory. Disables the model's
    /// activation cache at load time.
    #[serde(default)]
    pub gradient_checkpointing: bool,

    /// Storage precision of weights that are not quantized.
    #[serde(default)]
    pub load_dtype: Precision,

    /// 4-bit quantization of linear weights; `None` loads them unquantized.
    #[serde(default = "default_quantization")]
    pub quantization: Option<QuantizationSettings>,

    /// `LoRA` adapter hyperparameters.
    #[serde(default)]
    pub lora: LoraSettings,

    /// Training hyperparameters.
    #[serde(default)]
    pub trainer: TrainerConfig,

    /// Collate batches for masked (instead of next-token) language modeling.
    #[serde(default, alias = "mlm")]
    pub masked_language_modeling: bool,

    /// Fraction of tokens masked when `masked_language_modeling` is set.
    #[serde(default = "default_mlm_probability")]
    pub mlm_probability: f64,

    /// Dataset to train on.
    pub dataset: DatasetSource,

    /// Where trained artifacts are published.
    pub publish: PublishTarget,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_quantization() -> Option<QuantizationSettings> {
    Some(QuantizationSettings::default())
}
fn default_mlm_probability() -> f64 {
    0.15
}
fn default_seed() -> u64 {
    42
}

/// Floating point storage precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float.
    F32,
    /// 16-bit float.
    #[default]
    F16,
    /// 16-bit brain float.
    Bf16,
}

impl Precision {
    /// The candle dtype for this precision.
    #[must_use]
    pub fn dtype(self) -> candle_core::DType {
        match self {
            Self::F32 => candle_core::DType::F32,
            Self::F16 => candle_core::DType::F16,
            Self::Bf16 => candle_core::DType::BF16,
        }
    }
}

/// PEFT task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Causal language modeling.
    #[default]
    CausalLm,
    /// Sequence-to-sequence language modeling.
    #[serde(rename = "SEQ_2_SEQ_LM")]
    Seq2SeqLm,
    /// Sequence classification.
    SeqCls,
    /// Token classification.
    TokenCls,
}

/// LoRA-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoraSettings {
    /// Rank of low-rank decomposition.
    #[serde(default = "default_lora_r", alias = "rank")]
    pub r: usize,

    /// Scaling factor.
    #[serde(default = "default_lora_alpha", alias = "lora_alpha")]
    pub alpha: usize,

    /// Dropout probability.
    #[serde(default = "default_lora_dropout", alias = "lora_dropout")]
    pub dropout: f64,

    /// Module names to adapt. A module matches when its name equals an entry
    /// or ends with `.<entry>`.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Task the adapter is trained for.
    #[serde(default)]
    pub task_type: TaskType,
}

fn default_lora_r() -> usize {
    8
}
fn default_lora_alpha() -> usize {
    32
}
fn default_lora_dropout() -> f64 {
    0.05
}
fn default_target_modules() -> Vec<String> {
    vec!["query_key_value".into()]
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: default_lora_r(),
            alpha: default_lora_alpha(),
            dropout: default_lora_dropout(),
            target_modules: default_target_modules(),
            task_type: TaskType::CausalLm,
        }
    }
}

impl LoraSettings {
    /// Multiplier applied to the low-rank update.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.alpha as f64 / self.r as f64
    }
}

/// Quantization settings for `QLoRA`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantizationSettings {
    /// Number of bits (4 for `QLoRA`).
    #[serde(default = "default_bits")]
    pub bits: u8,

    /// Quantization type.
    #[serde(default)]
    pub quant_type: QuantType,

    /// Use double quantization. Accepted for compatibility with `QLoRA`
    /// configs; base weights keep `f32` block scales.
    #[serde(default = "default_true")]
    pub double_quant: bool,

    /// Block size for quantization.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_bits() -> u8 {
    4
}
fn default_true() -> bool {
    true
}
fn default_block_size() -> usize {
    64
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            bits: 4,
            quant_type: QuantType::Nf4,
            double_quant: true,
            block_size: 64,
        }
    }
}

/// Quantization type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    /// 4-bit `NormalFloat`.
    #[default]
    Nf4,
    /// 4-bit float point. Parsed, but rejected by [`RunConfig::validate`].
    Fp4,
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs", alias = "num_train_epochs")]
    pub epochs: usize,

    /// Batch size per device.
    #[serde(default = "default_batch_size", alias = "per_device_train_batch_size")]
    pub batch_size: usize,

    /// Gradient accumulation steps.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate scheduler.
    #[serde(default)]
    pub lr_scheduler: LrScheduler,

    /// Fraction of total steps spent warming up.
    #[serde(default)]
    pub warmup_ratio: f64,

    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Maximum gradient norm for clipping; 0 disables clipping.
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,

    /// Save checkpoint every N steps.
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,

    /// Log every N steps.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Directory for checkpoints and final artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_epochs() -> usize {
    3
}
fn default_batch_size() -> usize {
    4
}
fn default_grad_accum() -> usize {
    1
}
fn default_lr() -> f64 {
    2e-4
}
fn default_grad_norm() -> f64 {
    1.0
}
fn default_save_steps() -> usize {
    500
}
fn default_log_steps() -> usize {
    10
}
fn default_output_dir() -> String {
    "./outputs".into()
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            learning_rate: default_lr(),
            lr_scheduler: LrScheduler::Linear,
            warmup_ratio: 0.0,
            weight_decay: 0.0,
            max_grad_norm: default_grad_norm(),
            save_steps: default_save_steps(),
            logging_steps: default_log_steps(),
            output_dir: default_output_dir(),
        }
    }
}

/// Learning rate scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrScheduler {
    /// Linear decay to zero.
    #[default]
    Linear,
    /// Cosine annealing to zero.
    Cosine,
    /// Constant learning rate.
    Constant,
}

/// Dataset to resolve through the dataset registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSource {
    /// Dataset repository identifier.
    pub repo_id: String,

    /// Split consumed by the training loop.
    #[serde(default = "default_split")]
    pub split: String,
}

fn default_split() -> String {
    "train".into()
}

/// Artifact repository receiving the trained adapter and tokenizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishTarget {
    /// Repository identifier.
    pub repo_id: String,
}

impl RunConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Presets leave `dataset.repo_id` and `publish.repo_id` empty; they must
    /// be filled in before the configuration validates.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset name is unknown.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "falcon-7b" => Ok(Self::falcon_7b_preset()),
            "toy" => Ok(Self::toy_preset()),
            _ => Err(TuneError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    fn falcon_7b_preset() -> Self {
        Self {
            pretrained_model_name: "tiiuae/falcon-7b".into(),
            gradient_checkpointing: true,
            load_dtype: Precision::Bf16,
            quantization: Some(QuantizationSettings::default()),
            lora: LoraSettings::default(),
            trainer: TrainerConfig {
                epochs: 1,
                batch_size: 4,
                gradient_accumulation_steps: 4,
                learning_rate: 2e-4,
                warmup_ratio: 0.03,
                output_dir: "./outputs/falcon-7b-qlora".into(),
                ..Default::default()
            },
            masked_language_modeling: false,
            mlm_probability: default_mlm_probability(),
            dataset: DatasetSource {
                repo_id: String::new(),
                split: default_split(),
            },
            publish: PublishTarget::default(),
            seed: default_seed(),
        }
    }

    fn toy_preset() -> Self {
        Self {
            pretrained_model_name: "toy-model".into(),
            gradient_checkpointing: false,
            load_dtype: Precision::F16,
            quantization: None,
            lora: LoraSettings::default(),
            trainer: TrainerConfig {
                epochs: 1,
                batch_size: 2,
                learning_rate: 1e-3,
                logging_steps: 1,
                output_dir: "./outputs/toy-lora".into(),
                ..Default::default()
            },
            masked_language_modeling: false,
            mlm_probability: default_mlm_probability(),
            dataset: DatasetSource {
                repo_id: String::new(),
                split: default_split(),
            },
            publish: PublishTarget::default(),
            seed: default_seed(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.pretrained_model_name.trim().is_empty() {
            return Err(TuneError::Config(
                "pretrained_model_name is required".into(),
            ));
        }

        if self.dataset.repo_id.trim().is_empty() {
            return Err(TuneError::Config("dataset.repo_id is required".into()));
        }

        if self.dataset.split.trim().is_empty() {
            return Err(TuneError::Config("dataset.split must not be empty".into()));
        }

        if self.publish.repo_id.trim().is_empty() {
            return Err(TuneError::Config("publish.repo_id is required".into()));
        }

        self.validate_lora()?;
        self.validate_trainer()?;

        if let Some(quant) = &self.quantization {
            if quant.bits != 4 {
                return Err(TuneError::Config(format!(
                    "quantization.bits must be 4, got {}",
                    quant.bits
                )));
            }
            if quant.block_size == 0 {
                return Err(TuneError::Config(
                    "quantization.block_size must be > 0".into(),
                ));
            }
            if quant.quant_type != QuantType::Nf4 {
                return Err(TuneError::Config(
                    "quantization.quant_type must be nf4".into(),
                ));
            }
        }

        if self.masked_language_modeling
            && !(self.mlm_probability > 0.0 && self.mlm_probability < 1.0)
        {
            return Err(TuneError::Config(
                "mlm_probability must be in (0, 1)".into(),
            ));
        }

        Ok(())
    }

    fn validate_lora(&self) -> Result<()> {
        let lora = &self.lora;
        if lora.r == 0 {
            return Err(TuneError::Config("lora.r must be > 0".into()));
        }
        if lora.alpha == 0 {
            return Err(TuneError::Config("lora.alpha must be > 0".into()));
        }
        if !(0.0..1.0).contains(&lora.dropout) {
            return Err(TuneError::Config("lora.dropout must be in [0, 1)".into()));
        }
        if lora.target_modules.is_empty() {
            return Err(TuneError::Config(
                "lora.target_modules must name at least one module".into(),
            ));
        }
        if lora.task_type != TaskType::CausalLm {
            return Err(TuneError::Config(format!(
                "lora.task_type {:?} is not supported for causal language models",
                lora.task_type
            )));
        }
        Ok(())
    }

    fn validate_trainer(&self) -> Result<()> {
        let trainer = &self.trainer;
        if trainer.batch_size == 0 {
            return Err(TuneError::Config("trainer.batch_size must be > 0".into()));
        }
        if trainer.gradient_accumulation_steps == 0 {
            return Err(TuneError::Config(
                "trainer.gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if !(trainer.learning_rate.is_finite() && trainer.learning_rate > 0.0) {
            return Err(TuneError::Config(
                "trainer.learning_rate must be a positive number".into(),
            ));
        }
        if !(0.0..=1.0).contains(&trainer.warmup_ratio) {
            return Err(TuneError::Config(
                "trainer.warmup_ratio must be in [0, 1]".into(),
            ));
        }
        if trainer.max_grad_norm < 0.0 {
            return Err(TuneError::Config(
                "trainer.max_grad_norm must be >= 0".into(),
            ));
        }
        if trainer.logging_steps == 0 || trainer.save_steps == 0 {
            return Err(TuneError::Config(
                "trainer.logging_steps and trainer.save_steps must be > 0".into(),
            ));
        }
        if trainer.output_dir.trim().is_empty() {
            return Err(TuneError::Config("trainer.output_dir is required".into()));
        }
        Ok(())
    }
}
