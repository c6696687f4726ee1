//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use lora_tune::config::{LoraSettings, PublishTarget, RunConfig};
use lora_tune::dataset::{write_jsonl, TokenizedRecord};
use lora_tune::model::{ModelConfig, CONFIG_FILENAME, WEIGHTS_FILENAME};
use lora_tune::tokenizer::TOKENIZER_FILENAME;

/// Two-block Falcon-style model over a 16-token vocabulary.
pub fn toy_model_config() -> ModelConfig {
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

/// Word-level tokenizer over `<unk> </s> <mask> a..m`.
pub fn tokenizer_json() -> String {
    let mut vocab = vec![
        "\"<unk>\": 0".to_string(),
        "\"</s>\": 1".to_string(),
        "\"<mask>\": 2".to_string(),
    ];
    for (i, c) in ('a'..='m').enumerate() {
        vocab.push(format!("\"{c}\": {}", i + 3));
    }
    format!(
        r#"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {{"type": "Whitespace"}},
  "post_processor": null,
  "decoder": null,
  "model": {{"type": "WordLevel", "vocab": {{{}}}, "unk_token": "<unk>"}}
}}"#,
        vocab.join(", ")
    )
}

/// Write `<root>/<name>/{config.json, model.safetensors, tokenizer.json}`.
pub fn write_toy_model(root: &Path, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let config = toy_model_config();
    std::fs::write(
        dir.join(CONFIG_FILENAME),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let tensors: HashMap<String, Tensor> = config
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
        .collect();
    candle_core::safetensors::save(&tensors, dir.join(WEIGHTS_FILENAME)).unwrap();
    std::fs::write(dir.join(TOKENIZER_FILENAME), tokenizer_json()).unwrap();
}

/// Write `rows` records of length 4 to `<root>/<repo_id>/<split>.jsonl`.
pub fn write_dataset(root: &Path, repo_id: &str, split: &str, rows: usize) {
    let records: Vec<TokenizedRecord> = (0..rows)
        .map(|i| {
            let start = 3 + u32::try_from(i % 8).unwrap();
            TokenizedRecord::new(vec![start, start + 1, start + 2, start + 3])
        })
        .collect();
    write_jsonl(&root.join(repo_id).join(format!("{split}.jsonl")), &records).unwrap();
}

/// Run configuration for the toy model writing into `output_dir`.
pub fn toy_run_config(output_dir: &Path) -> RunConfig {
    let mut config = RunConfig::from_preset("toy").unwrap();
    config.pretrained_model_name = "toy-model".into();
    config.gradient_checkpointing = false;
    config.lora = LoraSettings {
        r: 8,
        alpha: 32,
        dropout: 0.05,
        target_modules: vec!["query_key_value".into()],
        ..Default::default()
    };
    config.masked_language_modeling = false;
    config.dataset.repo_id = "org/tokenized".into();
    config.publish = PublishTarget {
        repo_id: "org/toy-model-lora".into(),
    };
    config.trainer.output_dir = output_dir.to_string_lossy().into_owned();
    config
}
