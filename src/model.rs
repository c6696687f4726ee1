//! Causal language model loading and preparation for adapter training.
//!
//! [`CausalLm`] is a decoder in the Falcon layout: every block runs attention
//! and MLP in parallel on the same normalized input. Weights live in a named
//! parameter store so that loading, quantization, freezing and adapter
//! injection can address them by name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear};
use serde::{Deserialize, Serialize};

use crate::config::{QuantType, QuantizationSettings, RunConfig};
use crate::error::{Result, TuneError};
use crate::quantization::PackedWeight;

/// Architecture file inside a model directory.
pub const CONFIG_FILENAME: &str = "config.json";
/// Weights file inside a model directory.
pub const WEIGHTS_FILENAME: &str = "model.safetensors";

/// Architecture hyperparameters read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Width of the residual stream.
    pub hidden_size: usize,
    /// Attention heads per block.
    #[serde(default = "default_heads")]
    pub num_attention_heads: usize,
    /// Number of decoder blocks.
    pub num_hidden_layers: usize,
    /// MLP width; defaults to `4 * hidden_size`.
    #[serde(default)]
    pub intermediate_size: Option<usize>,
    /// Layer norm epsilon.
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
    /// Keep attention key/value activations between calls.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// End-of-sequence token id, if the checkpoint declares one.
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_heads() -> usize {
    1
}
fn default_eps() -> f64 {
    1e-5
}
fn default_use_cache() -> bool {
    true
}

impl ModelConfig {
    /// Read a `config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// MLP width.
    #[must_use]
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.hidden_size)
    }

    /// Width of one attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Check the hyperparameters describe a buildable model.
    ///
    /// # Errors
    ///
    /// Returns an error on zero sizes or a hidden size not divisible by the
    /// head count.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_attention_heads == 0 {
            return Err(TuneError::Model(
                "vocab_size, hidden_size and num_attention_heads must be > 0".into(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(TuneError::Model(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    /// Names of the linear modules, in forward order.
    #[must_use]
    pub fn linear_modules(&self) -> Vec<String> {
        let mut modules = Vec::with_capacity(self.num_hidden_layers * 4 + 1);
        for i in 0..self.num_hidden_layers {
            let block = format!("transformer.h.{i}");
            modules.push(format!("{block}.self_attention.query_key_value"));
            modules.push(format!("{block}.self_attention.dense"));
            modules.push(format!("{block}.mlp.dense_h_to_4h"));
            modules.push(format!("{block}.mlp.dense_4h_to_h"));
        }
        modules.push("lm_head".into());
        modules
    }

    /// Every weight the checkpoint must provide, with its shape.
    #[must_use]
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let h = self.hidden_size;
        let inter = self.intermediate_size();
        let mut shapes = vec![(
            "transformer.word_embeddings.weight".to_string(),
            vec![self.vocab_size, h],
        )];
        for i in 0..self.num_hidden_layers {
            let block = format!("transformer.h.{i}");
            shapes.push((format!("{block}.input_layernorm.weight"), vec![h]));
            shapes.push((format!("{block}.input_layernorm.bias"), vec![h]));
            shapes.push((
                format!("{block}.self_attention.query_key_value.weight"),
                vec![3 * h, h],
            ));
            shapes.push((format!("{block}.self_attention.dense.weight"), vec![h, h]));
            shapes.push((format!("{block}.mlp.dense_h_to_4h.weight"), vec![inter, h]));
            shapes.push((format!("{block}.mlp.dense_4h_to_h.weight"), vec![h, inter]));
        }
        shapes.push(("transformer.ln_f.weight".into(), vec![h]));
        shapes.push(("transformer.ln_f.bias".into(), vec![h]));
        shapes.push(("lm_head.weight".into(), vec![self.vocab_size, h]));
        shapes
    }
}

/// How weights are held in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    /// Dense floating point tensor.
    Float(DType),
    /// Packed 4-bit codes.
    Packed(QuantType),
}

impl StorageFormat {
    /// Half-width float formats that are upcast before training.
    #[must_use]
    pub fn is_reduced_float(self) -> bool {
        matches!(self, Self::Float(DType::F16 | DType::BF16))
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(dtype) => write!(f, "{dtype:?}"),
            Self::Packed(QuantType::Nf4) => f.write_str("nf4"),
            Self::Packed(QuantType::Fp4) => f.write_str("fp4"),
        }
    }
}

#[derive(Debug, Clone)]
enum ParamData {
    Dense(Tensor),
    Quantized(PackedWeight),
}

/// A named model weight.
#[derive(Debug, Clone)]
pub struct Parameter {
    data: ParamData,
    trainable: bool,
}

impl Parameter {
    /// Storage format of the weight.
    #[must_use]
    pub fn format(&self) -> StorageFormat {
        match &self.data {
            ParamData::Dense(t) => StorageFormat::Float(t.dtype()),
            ParamData::Quantized(q) => StorageFormat::Packed(q.quant_type()),
        }
    }

    /// Whether the optimizer may update this weight.
    #[must_use]
    pub fn trainable(&self) -> bool {
        self.trainable
    }

    /// Logical number of elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        match &self.data {
            ParamData::Dense(t) => t.elem_count(),
            ParamData::Quantized(q) => q.elem_count(),
        }
    }

    /// Logical shape.
    #[must_use]
    pub fn dims(&self) -> Vec<usize> {
        match &self.data {
            ParamData::Dense(t) => t.dims().to_vec(),
            ParamData::Quantized(q) => q.shape().to_vec(),
        }
    }

    /// The weight as an `f32` tensor, dequantizing packed storage.
    ///
    /// # Errors
    ///
    /// Returns an error if conversion fails.
    pub fn materialize(&self) -> Result<Tensor> {
        match &self.data {
            ParamData::Dense(t) if t.dtype() == DType::F32 => Ok(t.clone()),
            ParamData::Dense(t) => Ok(t.to_dtype(DType::F32)?),
            ParamData::Quantized(q) => q.dequantize(),
        }
    }
}

/// Options applied while loading a checkpoint.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Value written to the model's `use_cache` flag.
    pub use_cache: bool,
    /// Storage dtype for weights that are not quantized.
    pub dtype: DType,
    /// Quantize linear weights (except `lm_head`) when set.
    pub quantization: Option<QuantizationSettings>,
}

impl LoadOptions {
    /// Options for a run. Activation caching and gradient checkpointing are
    /// mutually exclusive, so the cache is off whenever checkpointing is on.
    #[must_use]
    pub fn for_run(config: &RunConfig) -> Self {
        Self {
            use_cache: !config.gradient_checkpointing,
            dtype: config.load_dtype.dtype(),
            quantization: config.quantization.clone(),
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            dtype: DType::F32,
            quantization: None,
        }
    }
}

/// Rewrites the output of a linear module; adapters plug in here.
pub trait LinearHook {
    /// Final output of `module` given its `input` and plain `output`.
    ///
    /// # Errors
    ///
    /// Returns an error if the output cannot be computed.
    fn adapt(&self, module: &str, input: &Tensor, output: Tensor) -> Result<Tensor>;
}

/// A [`LinearHook`] that leaves every output unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl LinearHook for NoHook {
    fn adapt(&self, _module: &str, _input: &Tensor, output: Tensor) -> Result<Tensor> {
        Ok(output)
    }
}

/// Decoder-only causal language model.
#[derive(Debug, Clone)]
pub struct CausalLm {
    config: ModelConfig,
    params: BTreeMap<String, Parameter>,
    device: Device,
    gradient_checkpointing: bool,
    input_requires_grad: bool,
}

impl CausalLm {
    /// Load `config.json` and `model.safetensors` from a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the files are missing, unreadable or do not match
    /// the declared architecture.
    pub fn from_pretrained(dir: &Path, options: &LoadOptions, device: &Device) -> Result<Self> {
        let config = ModelConfig::from_file(dir.join(CONFIG_FILENAME))?;
        let tensors = candle_core::safetensors::load(dir.join(WEIGHTS_FILENAME), device)?;
        Self::from_tensors(config, tensors, options, device)
    }

    /// Build a model from already loaded tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if a weight is missing or mis-shaped.
    pub fn from_tensors(
        mut config: ModelConfig,
        mut tensors: HashMap<String, Tensor>,
        options: &LoadOptions,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        config.use_cache = options.use_cache;

        let quantizable: Vec<String> = config
            .linear_modules()
            .into_iter()
            .filter(|m| m != "lm_head")
            .map(|m| format!("{m}.weight"))
            .collect();

        let mut params = BTreeMap::new();
        for (name, shape) in config.parameter_shapes() {
            let tensor = tensors
                .remove(&name)
                .ok_or_else(|| TuneError::Model(format!("missing weight: {name}")))?;
            if tensor.dims() != shape.as_slice() {
                return Err(TuneError::Model(format!(
                    "weight {name} has shape {:?}, expected {shape:?}",
                    tensor.dims()
                )));
            }
            let tensor = tensor.to_device(device)?;
            let data = match &options.quantization {
                Some(settings) if quantizable.contains(&name) => {
                    ParamData::Quantized(PackedWeight::quantize(&tensor, settings)?)
                }
                _ => ParamData::Dense(tensor.to_dtype(options.dtype)?),
            };
            params.insert(
                name,
                Parameter {
                    data,
                    trainable: true,
                },
            );
        }

        if !tensors.is_empty() {
            tracing::warn!("Ignoring {} unexpected tensors in checkpoint", tensors.len());
        }

        tracing::debug!(
            "Loaded {} parameters (use_cache={}, quantized={})",
            params.len(),
            config.use_cache,
            options.quantization.is_some()
        );

        Ok(Self {
            config,
            params,
            device: device.clone(),
            gradient_checkpointing: false,
            input_requires_grad: false,
        })
    }

    /// Architecture hyperparameters.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Device holding the weights.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether activations are cached between calls.
    #[must_use]
    pub fn use_cache(&self) -> bool {
        self.config.use_cache
    }

    /// Named parameters in name order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up one parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Total logical parameter count.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.params.values().map(Parameter::elem_count).sum()
    }

    /// Names of the linear modules adapters may target.
    #[must_use]
    pub fn linear_modules(&self) -> Vec<String> {
        self.config.linear_modules()
    }

    /// Mark every parameter as frozen.
    pub fn freeze(&mut self) {
        for param in self.params.values_mut() {
            param.trainable = false;
        }
    }

    /// Record that gradient checkpointing was requested.
    ///
    /// The flag is reported by [`Self::is_gradient_checkpointing`] and in
    /// training logs only: [`Self::forward`] does not read it and keeps every
    /// activation for backprop.
    pub fn gradient_checkpointing_enable(&mut self) {
        self.gradient_checkpointing = true;
    }

    /// Whether gradient checkpointing is on.
    #[must_use]
    pub fn is_gradient_checkpointing(&self) -> bool {
        self.gradient_checkpointing
    }

    /// Record that the input embedding output should require gradients.
    ///
    /// Not read by [`Self::forward`]: adapter gradients reach every block
    /// through the autograd graph whether or not this is set.
    pub fn enable_input_require_grads(&mut self) {
        self.input_requires_grad = true;
    }

    /// Whether the input embedding output requires gradients.
    #[must_use]
    pub fn input_requires_grad(&self) -> bool {
        self.input_requires_grad
    }

    /// Compute next-token logits `[batch, seq, vocab]` for `input_ids`
    /// `[batch, seq]`.
    ///
    /// Padding is expected on the right: with causal attention, real tokens
    /// never attend to it.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatches or tensor failures.
    pub fn forward(&self, input_ids: &Tensor, hook: &dyn LinearHook) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let embeddings = Embedding::new(
            self.weight("transformer.word_embeddings.weight")?,
            self.config.hidden_size,
        );
        let mut hidden = embeddings.forward(input_ids)?;
        let mask = Tensor::tril2(seq_len, DType::U8, &self.device)?;

        for i in 0..self.config.num_hidden_layers {
            let block = format!("transformer.h.{i}");
            let x = self.layer_norm(&format!("{block}.input_layernorm"), &hidden)?;
            let attn = self.attention(&block, &x, &mask, hook)?;
            let mlp = self.mlp(&block, &x, hook)?;
            hidden = ((hidden + attn)? + mlp)?;
        }

        let hidden = self.layer_norm("transformer.ln_f", &hidden)?;
        self.linear("lm_head", &hidden, hook)
    }

    fn weight(&self, name: &str) -> Result<Tensor> {
        self.params
            .get(name)
            .ok_or_else(|| TuneError::Model(format!("unknown parameter: {name}")))?
            .materialize()
    }

    fn linear(&self, module: &str, x: &Tensor, hook: &dyn LinearHook) -> Result<Tensor> {
        let layer = Linear::new(self.weight(&format!("{module}.weight"))?, None);
        hook.adapt(module, x, layer.forward(x)?)
    }

    fn layer_norm(&self, module: &str, x: &Tensor) -> Result<Tensor> {
        let weight = self.weight(&format!("{module}.weight"))?;
        let bias = self.weight(&format!("{module}.bias"))?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.config.layer_norm_epsilon)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&weight)?.broadcast_add(&bias)?)
    }

    fn attention(
        &self,
        block: &str,
        x: &Tensor,
        mask: &Tensor,
        hook: &dyn LinearHook,
    ) -> Result<Tensor> {
        let (batch, seq_len, hidden) = x.dims3()?;
        let heads = self.config.num_attention_heads;
        let head_dim = self.config.head_dim();

        let qkv = self.linear(&format!("{block}.self_attention.query_key_value"), x, hook)?;
        let split = |offset: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, offset, hidden)?
                .reshape((batch, seq_len, heads, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(hidden)?;
        let v = split(2 * hidden)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?)?.affine(scale, 0.0)?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, &self.device)?.broadcast_as(scores.shape())?;
        let scores = mask.broadcast_as(scores.shape())?.where_cond(&scores, &neg_inf)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden))?;
        self.linear(&format!("{block}.self_attention.dense"), &context, hook)
    }

    fn mlp(&self, block: &str, x: &Tensor, hook: &dyn LinearHook) -> Result<Tensor> {
        let up = self.linear(&format!("{block}.mlp.dense_h_to_4h"), x, hook)?;
        self.linear(&format!("{block}.mlp.dense_4h_to_h"), &up.gelu()?, hook)
    }
}

/// Freeze the model and make it safe to train a small adapter on top.
///
/// Every parameter is marked non-trainable and half-width float weights are
/// upcast to `f32`; packed 4-bit weights stay packed. With
/// `gradient_checkpointing`, checkpointing is enabled together with gradient
/// flow into the input embeddings, which checkpointing needs to propagate
/// through a frozen embedding layer.
///
/// # Errors
///
/// Returns an error if a weight cannot be converted.
pub fn prepare_model(model: &mut CausalLm, gradient_checkpointing: bool) -> Result<()> {
    let mut upcast = 0usize;
    for param in model.params.values_mut() {
        param.trainable = false;
        let widened = match &param.data {
            ParamData::Dense(t) if matches!(t.dtype(), DType::F16 | DType::BF16) => {
                Some(t.to_dtype(DType::F32)?)
            }
            _ => None,
        };
        if let Some(t) = widened {
            param.data = ParamData::Dense(t);
            upcast += 1;
        }
    }
    tracing::debug!("Froze {} parameters, upcast {upcast} to f32", model.params.len());

    if gradient_checkpointing {
        model.gradient_checkpointing_enable();
        model.enable_input_require_grads();
        tracing::info!("Gradient checkpointing enabled");
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn toy_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_attention_heads: 2,
            num_hidden_layers: 2,
            intermediate_size: Some(16),
            layer_norm_epsilon: 1e-5,
            use_cache: true,
            eos_token_id: Some(1),
        }
    }

    pub(crate) fn toy_tensors(config: &ModelConfig) -> HashMap<String, Tensor> {
        config
            .parameter_shapes()
            .into_iter()
            .map(|(name, shape)| {
                let tensor = if name.ends_with("layernorm.weight") || name.ends_with("ln_f.weight") {
                    Tensor::ones(shape.as_slice(), DType::F32, &Device::Cpu).unwrap()
                } else if name.ends_with(".bias") {
                    Tensor::zeros(shape.as_slice(), DType::F32, &Device::Cpu).unwrap()
                } else {
                    Tensor::randn(0f32, 0.02, shape.as_slice(), &Device::Cpu).unwrap()
                };
                (name, tensor)
            })
            .collect()
    }

    pub(crate) fn toy_model(options: &LoadOptions) -> CausalLm {
        let config = toy_config();
        let tensors = toy_tensors(&config);
        CausalLm::from_tensors(config, tensors, options, &Device::Cpu).unwrap()
    }

    fn quantized_options() -> LoadOptions {
        LoadOptions {
            use_cache: true,
            dtype: DType::F16,
            quantization: Some(QuantizationSettings {
                block_size: 16,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_load_options_disable_cache_for_checkpointing() {
        let mut config = RunConfig::from_preset("toy").unwrap();
        config.gradient_checkpointing = true;
        assert!(!LoadOptions::for_run(&config).use_cache);

        config.gradient_checkpointing = false;
        assert!(LoadOptions::for_run(&config).use_cache);
    }

    #[test]
    fn test_use_cache_written_to_model() {
        let options = LoadOptions {
            use_cache: false,
            ..Default::default()
        };
        let model = toy_model(&options);
        assert!(!model.use_cache());
        assert!(!model.config().use_cache);
    }

    #[test]
    fn test_loaded_parameters_start_trainable() {
        let model = toy_model(&LoadOptions::default());
        assert!(model.parameters().all(|(_, p)| p.trainable()));
        assert_eq!(model.parameters().count(), toy_config().parameter_shapes().len());
    }

    #[test]
    fn test_quantized_load_formats() {
        let model = toy_model(&quantized_options());
        let qkv = model
            .parameter("transformer.h.0.self_attention.query_key_value.weight")
            .unwrap();
        assert_eq!(qkv.format(), StorageFormat::Packed(QuantType::Nf4));
        assert_eq!(qkv.dims(), vec![24, 8]);

        let lm_head = model.parameter("lm_head.weight").unwrap();
        assert_eq!(lm_head.format(), StorageFormat::Float(DType::F16));

        let norm = model.parameter("transformer.ln_f.weight").unwrap();
        assert_eq!(norm.format(), StorageFormat::Float(DType::F16));
    }

    #[test]
    fn test_prepare_model_freezes_and_upcasts() {
        let mut model = toy_model(&quantized_options());
        let before: HashMap<String, StorageFormat> = model
            .parameters()
            .map(|(n, p)| (n.to_string(), p.format()))
            .collect();

        prepare_model(&mut model, false).unwrap();

        for (name, param) in model.parameters() {
            assert!(!param.trainable(), "{name} should be frozen");
            assert!(!param.format().is_reduced_float(), "{name} still half width");
            if before[name].is_reduced_float() {
                assert_eq!(param.format(), StorageFormat::Float(DType::F32));
            } else {
                assert_eq!(param.format(), before[name]);
            }
        }
        assert!(!model.is_gradient_checkpointing());
        assert!(!model.input_requires_grad());
    }

    #[test]
    fn test_prepare_model_enables_checkpointing() {
        let mut model = toy_model(&LoadOptions::default());
        prepare_model(&mut model, true).unwrap();
        assert!(model.is_gradient_checkpointing());
        assert!(model.input_requires_grad());
    }

    #[test]
    fn test_checkpointing_flags_leave_forward_unchanged() {
        let ids = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).unwrap();
        let mut model = toy_model(&LoadOptions::default());
        let before = model.forward(&ids, &NoHook).unwrap();
        prepare_model(&mut model, true).unwrap();
        let after = model.forward(&ids, &NoHook).unwrap();
        assert_eq!(
            before.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            after.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_missing_weight_rejected() {
        let config = toy_config();
        let mut tensors = toy_tensors(&config);
        tensors.remove("lm_head.weight");
        let err = CausalLm::from_tensors(config, tensors, &LoadOptions::default(), &Device::Cpu)
            .unwrap_err();
        assert!(err.to_string().contains("lm_head.weight"));
    }

    #[test]
    fn test_misshaped_weight_rejected() {
        let config = toy_config();
        let mut tensors = toy_tensors(&config);
        tensors.insert(
            "lm_head.weight".into(),
            Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        let result = CausalLm::from_tensors(config, tensors, &LoadOptions::default(), &Device::Cpu);
        assert!(matches!(result, Err(TuneError::Model(_))));
    }

    #[test]
    fn test_invalid_head_count_rejected() {
        let mut config = toy_config();
        config.num_attention_heads = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_forward_shape() {
        let model = toy_model(&quantized_options());
        let ids = Tensor::new(&[[3u32, 4, 5, 6], [7, 8, 1, 1]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids, &NoHook).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 16]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn test_forward_is_causal() {
        let model = toy_model(&LoadOptions::default());
        let a = Tensor::new(&[[3u32, 4, 5, 6]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[3u32, 4, 9, 10]], &Device::Cpu).unwrap();
        let la = model.forward(&a, &NoHook).unwrap();
        let lb = model.forward(&b, &NoHook).unwrap();
        let prefix_a = la.narrow(1, 0, 2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let prefix_b = lb.narrow(1, 0, 2).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in prefix_a.iter().zip(&prefix_b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_linear_modules_cover_each_block() {
        let modules = toy_config().linear_modules();
        assert_eq!(modules.len(), 2 * 4 + 1);
        assert!(modules.contains(&"transformer.h.1.self_attention.query_key_value".to_string()));
        assert_eq!(modules.last().map(String::as_str), Some("lm_head"));
    }

    #[test]
    fn test_from_pretrained_reads_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = toy_config();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();
        candle_core::safetensors::save(&toy_tensors(&config), dir.path().join(WEIGHTS_FILENAME))
            .unwrap();

        let model =
            CausalLm::from_pretrained(dir.path(), &LoadOptions::default(), &Device::Cpu).unwrap();
        assert_eq!(model.config().vocab_size, 16);
        assert!(model.num_parameters() > 0);
    }
}
