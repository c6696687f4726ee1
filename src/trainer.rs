//! Training loop and optimization.

use std::path::{Path, PathBuf};

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::adapters::LoraModel;
use crate::collator::{Batch, DataCollator};
use crate::config::TrainerConfig;
use crate::dataset::{Dataset, TokenizedRecord};
use crate::error::{Result, TuneError};
use crate::scheduler::LrSchedule;

/// Trainer state file written into every checkpoint.
pub const TRAINER_STATE_FILENAME: &str = "trainer_state.json";

/// One logged optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Optimizer step.
    pub step: usize,
    /// Epoch the step belongs to.
    pub epoch: usize,
    /// Mean loss over the step's micro-batches.
    pub loss: f64,
    /// Learning rate applied.
    pub learning_rate: f64,
    /// Gradient norm before clipping.
    pub grad_norm: f64,
}

/// Counters persisted with a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Epoch in progress.
    pub epoch: usize,
    /// Value of `global_step` when `epoch` started.
    pub epoch_start_step: usize,
    /// Logged steps.
    pub log_history: Vec<LogEntry>,
}

/// Result of [`Trainer::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    /// Optimizer steps taken, including resumed ones.
    pub global_step: usize,
    /// Mean loss over the steps taken in this call.
    pub training_loss: f64,
}

/// Training orchestrator.
pub struct Trainer {
    model: LoraModel,
    dataset: Dataset,
    config: TrainerConfig,
    collator: DataCollator,
    seed: u64,
    /// Current step
    step: usize,
    /// Current epoch
    epoch: usize,
    epoch_start_step: usize,
    log_history: Vec<LogEntry>,
}

impl Trainer {
    /// Create a new trainer.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] if the batch size, accumulation steps,
    /// logging interval or save interval is zero.
    pub fn new(
        model: LoraModel,
        dataset: Dataset,
        config: TrainerConfig,
        collator: DataCollator,
        seed: u64,
    ) -> Result<Self> {
        if config.batch_size == 0 || config.gradient_accumulation_steps == 0 {
            return Err(TuneError::Config(
                "batch_size and gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if config.logging_steps == 0 || config.save_steps == 0 {
            return Err(TuneError::Config(
                "logging_steps and save_steps must be > 0".into(),
            ));
        }

        Ok(Self {
            model,
            dataset,
            config,
            collator,
            seed,
            step: 0,
            epoch: 0,
            epoch_start_step: 0,
            log_history: Vec::new(),
        })
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &LoraModel {
        &self.model
    }

    /// Give back the trained model.
    #[must_use]
    pub fn into_model(self) -> LoraModel {
        self.model
    }

    /// Optimizer steps taken so far.
    #[must_use]
    pub fn global_step(&self) -> usize {
        self.step
    }

    /// Logged steps so far.
    #[must_use]
    pub fn log_history(&self) -> &[LogEntry] {
        &self.log_history
    }

    /// Optimizer steps in one epoch.
    #[must_use]
    pub fn steps_per_epoch(&self) -> usize {
        self.num_batches()
            .div_ceil(self.config.gradient_accumulation_steps)
    }

    fn num_batches(&self) -> usize {
        self.dataset.num_rows().div_ceil(self.config.batch_size)
    }

    /// Resume training from a checkpoint.
    ///
    /// Restores adapter weights and counters. Steps of the interrupted epoch
    /// that were already taken are skipped. Optimizer moments start fresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be loaded.
    pub fn resume_from(&mut self, checkpoint_path: &Path) -> Result<()> {
        let state_path = checkpoint_path.join(TRAINER_STATE_FILENAME);
        if !state_path.is_file() {
            return Err(TuneError::Checkpoint(format!(
                "no {TRAINER_STATE_FILENAME} in {}",
                checkpoint_path.display()
            )));
        }
        let state: TrainerState = serde_json::from_str(&std::fs::read_to_string(&state_path)?)?;
        self.model
            .adapter_mut()
            .load_weights(checkpoint_path)
            .map_err(|e| TuneError::Checkpoint(format!("{}: {e}", checkpoint_path.display())))?;

        self.step = state.global_step;
        self.epoch = state.epoch;
        self.epoch_start_step = state.epoch_start_step;
        self.log_history = state.log_history;
        tracing::info!(
            "Resumed from {} at step {} (epoch {})",
            checkpoint_path.display(),
            self.step,
            self.epoch + 1
        );
        Ok(())
    }

    /// Run the training loop.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch cannot be collated, the forward or backward
    /// pass fails, or a checkpoint cannot be written.
    pub fn train(&mut self) -> Result<TrainOutput> {
        tracing::info!("Starting training");
        tracing::info!("  Base model: {}", self.model.base_name());
        tracing::info!("  Examples: {}", self.dataset.num_rows());
        tracing::info!("  Epochs: {}", self.config.epochs);
        tracing::info!(
            "  Batch size: {} (accumulation {})",
            self.config.batch_size,
            self.config.gradient_accumulation_steps
        );
        if self.model.base().is_gradient_checkpointing() {
            tracing::info!("  Gradient checkpointing: on");
        }

        std::fs::create_dir_all(&self.config.output_dir)?;

        let steps_per_epoch = self.steps_per_epoch();
        let total_steps = steps_per_epoch * self.config.epochs;
        if total_steps == 0 {
            tracing::warn!("Nothing to train: dataset split is empty or epochs is 0");
            return Ok(TrainOutput {
                global_step: self.step,
                training_loss: 0.0,
            });
        }

        let schedule = LrSchedule::new(&self.config, total_steps);
        let vars = self.model.adapter().vars();
        let params = ParamsAdamW {
            lr: schedule.lr_at(self.step),
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(vars.clone(), params)?;
        let device = self.model.base().device().clone();

        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )?
                .progress_chars("#>-"),
        );
        pb.set_position(self.step.min(total_steps) as u64);

        self.model.adapter_mut().set_training(true);
        let accum = self.config.gradient_accumulation_steps;
        let first_epoch = self.epoch;
        let mut loss_sum = 0.0;
        let mut steps_taken = 0usize;
        let mut last_saved = None;

        for epoch in first_epoch..self.config.epochs {
            if epoch != first_epoch || self.step == 0 {
                self.epoch_start_step = self.step;
            }
            self.epoch = epoch;
            let skip_steps = self.step - self.epoch_start_step;
            tracing::info!("Starting epoch {}/{}", epoch + 1, self.config.epochs);

            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            let mut order: Vec<usize> = (0..self.dataset.num_rows()).collect();
            order.shuffle(&mut rng);
            let batches: Vec<&[usize]> = order.chunks(self.config.batch_size).collect();

            for (group_idx, group) in batches.chunks(accum).enumerate() {
                if group_idx < skip_steps {
                    continue;
                }
                let rows = self.dataset.rows();
                let mut accumulated: Option<GradStore> = None;
                let mut group_loss = 0.0;
                #[allow(clippy::cast_precision_loss)]
                let group_len = group.len() as f64;

                for indices in group {
                    let records: Vec<&TokenizedRecord> = indices.iter().map(|&i| &rows[i]).collect();
                    let batch = self.collator.collate(&records, &mut rng, &device)?;
                    let loss = self.loss(&batch)?;
                    group_loss += f64::from(loss.to_scalar::<f32>()?);
                    let grads = (loss / group_len)?.backward()?;
                    accumulated = Some(match accumulated {
                        None => grads,
                        Some(acc) => accumulate(acc, &grads, &vars)?,
                    });
                }

                let Some(mut grads) = accumulated else {
                    continue;
                };
                let grad_norm = clip_grad_norm(&mut grads, &vars, self.config.max_grad_norm)?;
                let lr = schedule.lr_at(self.step);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;

                self.step += 1;
                steps_taken += 1;
                let loss = group_loss / group_len;
                loss_sum += loss;
                pb.inc(1);

                // Log periodically
                if self.step % self.config.logging_steps == 0 {
                    tracing::info!(
                        "step {}/{} | loss {loss:.4} | lr {lr:.2e} | grad_norm {grad_norm:.4}",
                        self.step,
                        total_steps
                    );
                    pb.set_message(format!("loss {loss:.4}"));
                    self.log_history.push(LogEntry {
                        step: self.step,
                        epoch,
                        loss,
                        learning_rate: lr,
                        grad_norm,
                    });
                }

                // Save checkpoint periodically
                if self.step % self.config.save_steps == 0 {
                    self.save_checkpoint()?;
                    last_saved = Some(self.step);
                }
            }
        }

        pb.finish_with_message("Training complete");
        self.model.adapter_mut().set_training(false);

        if last_saved != Some(self.step) {
            self.save_checkpoint()?;
        }

        #[allow(clippy::cast_precision_loss)]
        let training_loss = if steps_taken == 0 {
            0.0
        } else {
            loss_sum / steps_taken as f64
        };
        tracing::info!(
            "Training finished after {} steps (loss {training_loss:.4})",
            self.step
        );
        Ok(TrainOutput {
            global_step: self.step,
            training_loss,
        })
    }

    fn loss(&self, batch: &Batch) -> Result<Tensor> {
        let logits = self.model.forward(&batch.input_ids)?;
        if self.collator.is_masked() {
            masked_lm_loss(&logits, &batch.labels)
        } else {
            causal_lm_loss(&logits, &batch.labels)
        }
    }

    /// Directory of the checkpoint for the current step.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        Path::new(&self.config.output_dir).join(format!("checkpoint-{}", self.step))
    }

    /// Save a checkpoint.
    fn save_checkpoint(&self) -> Result<()> {
        let checkpoint_dir = self.checkpoint_dir();
        self.model.save_pretrained(&checkpoint_dir)?;

        let state = TrainerState {
            global_step: self.step,
            epoch: self.epoch,
            epoch_start_step: self.epoch_start_step,
            log_history: self.log_history.clone(),
        };
        std::fs::write(
            checkpoint_dir.join(TRAINER_STATE_FILENAME),
            serde_json::to_string_pretty(&state)?,
        )?;

        tracing::info!("Saved checkpoint to: {}", checkpoint_dir.display());
        Ok(())
    }
}

fn accumulate(mut acc: GradStore, grads: &GradStore, vars: &[Var]) -> Result<GradStore> {
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let sum = match acc.get(var.as_tensor()) {
            Some(prev) => prev.add(grad)?,
            None => grad.clone(),
        };
        acc.insert(var.as_tensor(), sum);
    }
    Ok(acc)
}

/// Scale gradients so their global L2 norm is at most `max_norm` and return
/// the norm before scaling. `max_norm <= 0` only measures.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut squared = 0.0;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            squared += f64::from(grad.sqr()?.sum_all()?.to_scalar::<f32>()?);
        }
    }
    let norm = squared.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let factor = max_norm / (norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => grad.affine(factor, 0.0)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(norm)
}

/// Mean cross-entropy of `logits [n, vocab]` against `labels [n]`, skipping
/// negative labels.
fn token_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let mask = labels.ge(0i64)?.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(Tensor::zeros((), DType::F32, logits.device())?);
    }
    let targets = labels.maximum(0i64)?.to_dtype(DType::U32)?.unsqueeze(1)?;
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;
    let total = (picked * mask)?.sum_all()?;
    Ok(total.affine(-1.0 / f64::from(count), 0.0)?)
}

/// Next-token cross-entropy: position `t` predicts label `t + 1`.
///
/// # Errors
///
/// Returns an error if `logits` is not `[batch, seq, vocab]` or does not
/// match `labels`.
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    if seq_len < 2 {
        return Ok(Tensor::zeros((), DType::F32, logits.device())?);
    }
    let shifted_logits = logits
        .narrow(1, 0, seq_len - 1)?
        .contiguous()?
        .reshape((batch * (seq_len - 1), vocab))?;
    let shifted_labels = labels
        .narrow(1, 1, seq_len - 1)?
        .contiguous()?
        .reshape(batch * (seq_len - 1))?;
    token_loss(&shifted_logits, &shifted_labels)
}

/// Cross-entropy at the labeled positions themselves.
///
/// # Errors
///
/// Returns an error if `logits` is not `[batch, seq, vocab]` or does not
/// match `labels`.
pub fn masked_lm_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let flat_logits = logits.reshape((batch * seq_len, vocab))?;
    let flat_labels = labels.reshape(batch * seq_len)?;
    token_loss(&flat_logits, &flat_labels)
}

/// Read the state saved with a checkpoint.
///
/// # Errors
///
/// Returns an error if the file is missing or malformed.
pub fn read_trainer_state(checkpoint_path: &Path) -> Result<TrainerState> {
    let content = std::fs::read_to_string(checkpoint_path.join(TRAINER_STATE_FILENAME))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LoraModel;
    use crate::config::LoraSettings;
    use crate::model::tests::toy_model;
    use crate::model::{prepare_model, LoadOptions};
    use candle_core::Device;
    use tempfile::TempDir;

    /// Helper to create a trainer config writing into `output_dir`
    fn create_test_config(output_dir: &Path) -> TrainerConfig {
        TrainerConfig {
            epochs: 1,
            batch_size: 5,
            learning_rate: 1e-2,
            logging_steps: 1,
            save_steps: 1000,
            output_dir: output_dir.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    /// Helper to create a dataset of `rows` records of length 4
    fn create_test_dataset(rows: usize) -> Dataset {
        let records = (0..rows)
            .map(|i| {
                let start = 3 + u32::try_from(i % 6).unwrap();
                TokenizedRecord::new(vec![start, start + 1, start + 2, start + 3])
            })
            .collect();
        Dataset::new("train", records)
    }

    fn create_test_model(targets: &[&str], dropout: f64) -> LoraModel {
        let mut base = toy_model(&LoadOptions::default());
        prepare_model(&mut base, false).unwrap();
        let settings = LoraSettings {
            dropout,
            target_modules: targets.iter().map(|s| (*s).to_string()).collect(),
            ..Default::default()
        };
        LoraModel::inject(base, &settings, "toy-model").unwrap()
    }

    fn create_trainer(config: TrainerConfig, rows: usize) -> Trainer {
        Trainer::new(
            create_test_model(&["query_key_value"], 0.05),
            create_test_dataset(rows),
            config,
            DataCollator::causal(1, 16),
            42,
        )
        .unwrap()
    }

    // ========================================================================
    // Tests for Trainer::new
    // ========================================================================

    #[test]
    fn test_trainer_new_initializes_counters() {
        let temp_dir = TempDir::new().unwrap();
        let trainer = create_trainer(create_test_config(temp_dir.path()), 10);

        assert_eq!(trainer.epoch, 0);
        assert_eq!(trainer.step, 0);
        assert_eq!(trainer.steps_per_epoch(), 2);
    }

    #[test]
    fn test_trainer_new_with_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let invalid: [fn(&mut TrainerConfig); 4] = [
            |c| c.batch_size = 0,
            |c| c.gradient_accumulation_steps = 0,
            |c| c.logging_steps = 0,
            |c| c.save_steps = 0,
        ];

        for break_config in invalid {
            let mut config = create_test_config(temp_dir.path());
            break_config(&mut config);
            let result = Trainer::new(
                create_test_model(&["query_key_value"], 0.0),
                create_test_dataset(4),
                config,
                DataCollator::causal(1, 16),
                0,
            );
            assert!(matches!(result, Err(TuneError::Config(_))));
        }
    }

    // ========================================================================
    // Tests for loss functions
    // ========================================================================

    #[test]
    fn test_causal_loss_shifts_and_ignores() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1i64, 2, -100]], &Device::Cpu).unwrap();
        let loss = causal_lm_loss(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((f64::from(loss) - 4f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_causal_loss_prefers_correct_token() {
        let logits = Tensor::new(
            &[[[0f32, 0.0, 0.0], [0.0, 0.0, 5.0]], [[0.0, 0.0, 0.0], [5.0, 0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[[0i64, 2], [0, 2]], &Device::Cpu).unwrap();
        let loss = causal_lm_loss(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // Only position 0 predicts; both rows see uniform logits there.
        assert!((f64::from(loss) - 3f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_masked_loss_without_targets_is_zero() {
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::full(-100i64, (2, 3), &Device::Cpu).unwrap();
        let loss = masked_lm_loss(&logits, &labels).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    // ========================================================================
    // Tests for train method
    // ========================================================================

    #[test]
    fn test_train_epoch_iteration() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.epochs = 3;

        let mut trainer = create_trainer(config, 10);
        let output = trainer.train().unwrap();

        // With 10 examples, batch size 5, and 3 epochs:
        // Each epoch has 2 batches, so 3 epochs = 6 steps total
        assert_eq!(output.global_step, 6);
        assert_eq!(trainer.epoch, 2);
        assert_eq!(trainer.log_history().len(), 6);
        assert!(output.training_loss.is_finite());
        assert!(output.training_loss > 0.0);
    }

    #[test]
    fn test_train_gradient_accumulation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.batch_size = 2;
        config.gradient_accumulation_steps = 2;

        // 5 micro-batches -> 3 optimizer steps, the last one partial
        let mut trainer = create_trainer(config, 10);
        assert_eq!(trainer.steps_per_epoch(), 3);
        assert_eq!(trainer.train().unwrap().global_step, 3);
    }

    #[test]
    fn test_train_with_empty_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = create_trainer(create_test_config(temp_dir.path()), 0);

        let output = trainer.train().unwrap();
        assert_eq!(output.global_step, 0);
        assert_eq!(trainer.step, 0);
    }

    #[test]
    fn test_train_reduces_loss() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.epochs = 10;
        config.lr_scheduler = crate::config::LrScheduler::Constant;

        let mut trainer = Trainer::new(
            create_test_model(&["query_key_value", "lm_head"], 0.0),
            create_test_dataset(10),
            config,
            DataCollator::causal(1, 16),
            7,
        )
        .unwrap();
        trainer.train().unwrap();

        let history = trainer.log_history();
        let first = history.first().unwrap().loss;
        let last = history.last().unwrap().loss;
        assert!(last < first, "loss did not decrease: {first} -> {last}");
    }

    #[test]
    fn test_train_updates_adapter_only() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = create_trainer(create_test_config(temp_dir.path()), 10);
        let before: Vec<Vec<f32>> = trainer
            .model()
            .adapter()
            .vars()
            .iter()
            .map(|v| v.flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        let base_before = trainer
            .model()
            .base()
            .parameter("lm_head.weight")
            .unwrap()
            .materialize()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        trainer.train().unwrap();

        let after: Vec<Vec<f32>> = trainer
            .model()
            .adapter()
            .vars()
            .iter()
            .map(|v| v.flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_ne!(before, after);
        let base_after = trainer
            .model()
            .base()
            .parameter("lm_head.weight")
            .unwrap()
            .materialize()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(base_before, base_after);
    }

    #[test]
    fn test_masked_collation_trains() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = Trainer::new(
            create_test_model(&["query_key_value"], 0.0),
            create_test_dataset(10),
            create_test_config(temp_dir.path()),
            DataCollator::masked(1, 16, Some(2), 0.5).unwrap(),
            3,
        )
        .unwrap();
        let output = trainer.train().unwrap();
        assert_eq!(output.global_step, 2);
        assert!(output.training_loss.is_finite());
    }

    // ========================================================================
    // Tests for checkpoints
    // ========================================================================

    #[test]
    fn test_checkpoint_directory_creation() {
        let temp_dir = TempDir::new().unwrap();
        let output_path = temp_dir.path().join("checkpoints");
        let mut config = create_test_config(&output_path);
        config.save_steps = 1;

        let mut trainer = create_trainer(config, 10);
        assert!(!output_path.exists());
        trainer.train().unwrap();

        for step in [1, 2] {
            let dir = output_path.join(format!("checkpoint-{step}"));
            assert!(dir.join(crate::adapters::ADAPTER_WEIGHTS_FILENAME).is_file());
            assert!(dir.join(crate::adapters::ADAPTER_CONFIG_FILENAME).is_file());
            let state = read_trainer_state(&dir).unwrap();
            assert_eq!(state.global_step, step);
        }
        assert!(!output_path.join("checkpoint-3").exists());
    }

    #[test]
    fn test_final_checkpoint_written() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = create_trainer(create_test_config(temp_dir.path()), 10);
        trainer.train().unwrap();
        assert!(temp_dir.path().join("checkpoint-2").is_dir());
        assert!(!temp_dir.path().join("checkpoint-1").exists());
    }

    #[test]
    fn test_resume_from_missing_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let mut trainer = create_trainer(create_test_config(temp_dir.path()), 10);

        let result = trainer.resume_from(&temp_dir.path().join("non-existent-checkpoint"));
        assert!(matches!(result, Err(TuneError::Checkpoint(_))));
    }

    #[test]
    fn test_resume_continues_counters() {
        let temp_dir = TempDir::new().unwrap();
        let mut first = create_trainer(create_test_config(temp_dir.path()), 10);
        first.train().unwrap();
        let module = "transformer.h.1.self_attention.query_key_value";
        let (_, b) = first.model().adapter().lora_weights(module).unwrap();
        let saved = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let mut config = create_test_config(temp_dir.path());
        config.epochs = 2;
        let mut second = create_trainer(config, 10);
        second
            .resume_from(&temp_dir.path().join("checkpoint-2"))
            .unwrap();
        assert_eq!(second.global_step(), 2);
        let (_, b) = second.model().adapter().lora_weights(module).unwrap();
        let restored = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(saved, restored);

        // Epoch 1 was complete; only epoch 2 runs.
        let output = second.train().unwrap();
        assert_eq!(output.global_step, 4);
        assert!(temp_dir.path().join("checkpoint-4").is_dir());
    }

    #[test]
    fn test_resume_mid_epoch_skips_taken_steps() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(temp_dir.path());
        config.batch_size = 2;
        config.save_steps = 2;
        let mut first = create_trainer(config.clone(), 10);
        first.train().unwrap();

        let mut second = create_trainer(config, 10);
        second
            .resume_from(&temp_dir.path().join("checkpoint-2"))
            .unwrap();
        // 5 steps per epoch, 2 already taken.
        assert_eq!(second.train().unwrap().global_step, 5);
    }
}
