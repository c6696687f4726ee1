use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lora_tune::RunConfig;

const CONFIG: &str = r"
pretrained_model_name: tiiuae/falcon-7b
gradient_checkpointing: true
lora:
  r: 8
  alpha: 32
  dropout: 0.05
  target_modules: [query_key_value]
trainer:
  epochs: 1
  batch_size: 4
  gradient_accumulation_steps: 4
dataset:
  repo_id: org/tokenized-corpus
publish:
  repo_id: org/falcon-7b-lora
";

fn benchmark_config_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_parsing");
    group.bench_function("parse_yaml", |b| {
        b.iter(|| serde_yaml::from_str::<RunConfig>(black_box(CONFIG)));
    });
    group.bench_function("parse_and_validate", |b| {
        b.iter(|| {
            let config: RunConfig = serde_yaml::from_str(black_box(CONFIG)).unwrap();
            config.validate().is_ok()
        });
    });
    let config: RunConfig = serde_yaml::from_str(CONFIG).unwrap();
    group.bench_function("serialize_yaml", |b| {
        b.iter(|| serde_yaml::to_string(black_box(&config)));
    });
    group.finish();
}

criterion_group!(benches, benchmark_config_parsing);
criterion_main!(benches);
