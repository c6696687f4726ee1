//! Adapter integration layer.
//!
//! Injects `peft-rs` [`LoraLayer`]s into a frozen [`CausalLm`]. Each targeted
//! linear module gets one layer whose `A`/`B` matrices live in a shared
//! [`VarMap`] for the optimizer. The adapted output is
//! `x Wᵀ + dropout(x) Aᵀ Bᵀ · alpha / r`, and `B` starts at zero so a fresh
//! adapter leaves the base model's output unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::{DType, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use peft_rs::{Adapter, LoraConfig as PeftLoraConfig, LoraLayer};
use serde::{Deserialize, Serialize};

use crate::config::{LoraSettings, TaskType};
use crate::error::{Result, TuneError};
use crate::model::{CausalLm, LinearHook};

pub use peft_rs::{ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME};

/// Prefix PEFT puts in front of base module names.
const PEFT_PREFIX: &str = "base_model.model";

/// Whether `module` is selected by `target`: an exact name or a dotted suffix.
#[must_use]
pub fn matches_target(module: &str, target: &str) -> bool {
    module == target
        || module
            .strip_suffix(target)
            .is_some_and(|head| head.ends_with('.'))
}

/// `peft-rs` layer configuration for `settings`.
#[must_use]
pub fn to_peft_lora_config(settings: &LoraSettings) -> PeftLoraConfig {
    PeftLoraConfig {
        r: settings.r,
        alpha: settings.alpha,
        dropout: settings.dropout,
        target_modules: settings.target_modules.clone(),
        ..Default::default()
    }
}

/// PEFT-compatible `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfigFile {
    /// Model the adapter was trained on.
    pub base_model_name_or_path: String,
    /// Adapter method.
    pub peft_type: String,
    /// Task type.
    pub task_type: TaskType,
    /// Rank.
    pub r: usize,
    /// Scaling numerator.
    pub lora_alpha: usize,
    /// Dropout probability.
    pub lora_dropout: f64,
    /// Target module names as configured.
    pub target_modules: Vec<String>,
    /// Bias handling; always `"none"`.
    pub bias: String,
    /// Whether the adapter was saved for inference only.
    pub inference_mode: bool,
}

/// Trainable-parameter report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSummary {
    /// Parameters the optimizer updates.
    pub trainable: usize,
    /// All parameters, base and adapter.
    pub total: usize,
}

impl ParameterSummary {
    /// Trainable share in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for ParameterSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

/// One adapted module: the `peft-rs` layer and the variables backing it.
struct AdaptedModule {
    layer: LoraLayer,
    a: Var,
    b: Var,
}

/// Low-rank adapter over a set of linear modules.
pub struct LoraAdapter {
    settings: LoraSettings,
    modules: BTreeMap<String, AdaptedModule>,
    training: bool,
}

impl std::fmt::Debug for LoraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraAdapter")
            .field("settings", &self.settings)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("training", &self.training)
            .finish()
    }
}

/// The variable in `varmap` whose tensor is `tensor`.
fn registered_var(varmap: &VarMap, tensor: &Tensor, module: &str) -> Result<Var> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| TuneError::Other("adapter variable map lock poisoned".into()))?;
    vars.values()
        .find(|v| v.as_tensor().id() == tensor.id())
        .cloned()
        .ok_or_else(|| {
            TuneError::Model(format!(
                "LoRA weights of {module} are not registered as trainable variables"
            ))
        })
}

fn peft_name(module: &str, matrix: &str) -> String {
    format!("{PEFT_PREFIX}.{module}.lora_{matrix}.weight")
}

impl LoraAdapter {
    /// Create a [`LoraLayer`] for every linear module of `model` selected by
    /// `settings.target_modules`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] if no module matches the targets.
    pub fn new(model: &CausalLm, settings: &LoraSettings) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, model.device());
        let peft_config = to_peft_lora_config(settings);
        let mut modules = BTreeMap::new();

        for module in model.linear_modules() {
            if !settings
                .target_modules
                .iter()
                .any(|t| matches_target(&module, t))
            {
                continue;
            }
            let weight = model
                .parameter(&format!("{module}.weight"))
                .ok_or_else(|| TuneError::Model(format!("no weight for module {module}")))?;
            let dims = weight.dims();
            let (out_features, in_features) = (dims[0], dims[1]);

            let layer = LoraLayer::new(
                in_features,
                out_features,
                peft_config.clone(),
                vb.pp(format!("{PEFT_PREFIX}.{module}")),
            )?;
            let (a, b) = layer.weights();
            let a = registered_var(&varmap, a, &module)?;
            let b = registered_var(&varmap, b, &module)?;
            tracing::debug!(
                "Adapting {module} ({out_features}x{in_features} -> rank {})",
                settings.r
            );
            modules.insert(module, AdaptedModule { layer, a, b });
        }

        if modules.is_empty() {
            return Err(TuneError::Config(format!(
                "target modules {:?} not found in the base model",
                settings.target_modules
            )));
        }

        Ok(Self {
            settings: settings.clone(),
            modules,
            training: true,
        })
    }

    /// Settings the adapter was built with.
    #[must_use]
    pub fn settings(&self) -> &LoraSettings {
        &self.settings
    }

    /// Adapted module names.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// `(A, B)` matrices of one adapted module.
    #[must_use]
    pub fn lora_weights(&self, module: &str) -> Option<(&Tensor, &Tensor)> {
        self.modules
            .get(module)
            .map(|m| (m.a.as_tensor(), m.b.as_tensor()))
    }

    /// Trainable variables for the optimizer: the A and B of every module.
    #[must_use]
    pub fn vars(&self) -> Vec<Var> {
        self.modules
            .values()
            .flat_map(|m| [m.a.clone(), m.b.clone()])
            .collect()
    }

    /// PEFT names of the trainable tensors.
    #[must_use]
    pub fn parameter_names(&self) -> BTreeSet<String> {
        self.modules
            .keys()
            .flat_map(|m| [peft_name(m, "A"), peft_name(m, "B")])
            .collect()
    }

    /// Number of trainable elements.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.modules.values().map(|m| m.layer.num_parameters()).sum()
    }

    /// Toggle dropout.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Write adapter weights under PEFT names and the adapter config into
    /// `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save(&self, dir: &Path, base_model: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let tensors: HashMap<String, Tensor> = self
            .modules
            .iter()
            .flat_map(|(name, m)| {
                [
                    (peft_name(name, "A"), m.a.as_tensor().clone()),
                    (peft_name(name, "B"), m.b.as_tensor().clone()),
                ]
            })
            .collect();
        candle_core::safetensors::save(&tensors, dir.join(ADAPTER_WEIGHTS_FILENAME))?;

        let config = AdapterConfigFile {
            base_model_name_or_path: base_model.to_string(),
            peft_type: "LORA".into(),
            task_type: self.settings.task_type,
            r: self.settings.r,
            lora_alpha: self.settings.alpha,
            lora_dropout: self.settings.dropout,
            target_modules: self.settings.target_modules.clone(),
            bias: "none".into(),
            inference_mode: false,
        };
        std::fs::write(
            dir.join(ADAPTER_CONFIG_FILENAME),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(())
    }

    /// Overwrite adapter weights in place with the ones saved in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Checkpoint`] if a module's weights are missing,
    /// or an error if a saved tensor does not fit its variable.
    pub fn load_weights(&mut self, dir: &Path) -> Result<()> {
        let device = self
            .modules
            .values()
            .next()
            .map_or(candle_core::Device::Cpu, |m| m.a.device().clone());
        let saved = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILENAME), &device)?;
        for (module, adapted) in &self.modules {
            for (matrix, var) in [("A", &adapted.a), ("B", &adapted.b)] {
                let name = peft_name(module, matrix);
                let tensor = saved
                    .get(&name)
                    .ok_or_else(|| TuneError::Checkpoint(format!("missing tensor {name}")))?;
                var.set(tensor)?;
            }
        }
        Ok(())
    }
}

impl LinearHook for LoraAdapter {
    fn adapt(&self, module: &str, input: &Tensor, output: Tensor) -> Result<Tensor> {
        let Some(adapted) = self.modules.get(module) else {
            return Ok(output);
        };
        let x = if self.training && self.settings.dropout > 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            let p = self.settings.dropout as f32;
            candle_nn::ops::dropout(input, p)?
        } else {
            input.clone()
        };
        Ok(adapted.layer.forward(&x, Some(&output))?)
    }
}

/// A frozen base model with exactly one injected adapter.
#[derive(Debug)]
pub struct LoraModel {
    base: CausalLm,
    adapter: LoraAdapter,
    base_name: String,
}

impl LoraModel {
    /// Wrap `base` with a `LoRA` adapter built from `settings`. Base
    /// parameters are frozen; only adapter parameters are trainable.
    ///
    /// # Errors
    ///
    /// Returns an error if no module matches `settings.target_modules`.
    pub fn inject(mut base: CausalLm, settings: &LoraSettings, base_name: &str) -> Result<Self> {
        base.freeze();
        let adapter = LoraAdapter::new(&base, settings)?;
        Ok(Self {
            base,
            adapter,
            base_name: base_name.to_string(),
        })
    }

    /// The frozen base model.
    #[must_use]
    pub fn base(&self) -> &CausalLm {
        &self.base
    }

    /// The adapter.
    #[must_use]
    pub fn adapter(&self) -> &LoraAdapter {
        &self.adapter
    }

    /// Mutable access to the adapter.
    pub fn adapter_mut(&mut self) -> &mut LoraAdapter {
        &mut self.adapter
    }

    /// Registry name of the base model.
    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Every parameter name with its trainable flag, base first.
    #[must_use]
    pub fn named_parameters(&self) -> Vec<(String, bool)> {
        let mut named: Vec<(String, bool)> = self
            .base
            .parameters()
            .map(|(n, p)| (n.to_string(), p.trainable()))
            .collect();
        named.extend(self.adapter.parameter_names().into_iter().map(|n| (n, true)));
        named
    }

    /// Count trainable and total parameters.
    #[must_use]
    pub fn parameter_summary(&self) -> ParameterSummary {
        let adapter = self.adapter.num_parameters();
        let base_trainable: usize = self
            .base
            .parameters()
            .filter(|(_, p)| p.trainable())
            .map(|(_, p)| p.elem_count())
            .sum();
        ParameterSummary {
            trainable: adapter + base_trainable,
            total: self.base.num_parameters() + adapter,
        }
    }

    /// Log the trainable-parameter report and return it.
    pub fn print_trainable_parameters(&self) -> ParameterSummary {
        let summary = self.parameter_summary();
        tracing::info!("{summary}");
        summary
    }

    /// Logits for `input_ids` with the adapter applied.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatches or tensor failures.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.base.forward(input_ids, &self.adapter)
    }

    /// Save the adapter (weights and config) into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        self.adapter.save(dir, &self.base_name)
    }
}
