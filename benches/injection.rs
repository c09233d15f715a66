//! Benchmarks for adapter injection and state-dict projection

#![allow(missing_docs)]

use std::sync::Arc;

use candle_core::Device;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use peft_shard::{LocalParallelState, LoraTuning, ModelDims, PeftConfig, PeftModel};
use serde_yaml::Value;

const CONFIG: &str = "
mcore_gpt: true
num_layers: 8
hidden_size: 256
num_attention_heads: 8
vocab_size: 512
";

fn model() -> PeftModel {
    let cfg: Value = serde_yaml::from_str(CONFIG).expect("bench config");
    PeftModel::from_config(cfg, Arc::new(LocalParallelState::single()), &Device::Cpu)
        .expect("bench model")
}

fn lora() -> PeftConfig {
    let tuning = LoraTuning {
        adapter_dim: 16,
        target_modules: vec!["all".into()],
        ..LoraTuning::default()
    };
    PeftConfig::lora(&ModelDims::new(256, 8), &tuning).expect("bench lora")
}

fn benchmark_injection(c: &mut Criterion) {
    let mut group = c.benchmark_group("injection");
    group.bench_function("inject_lora_all", |b| {
        b.iter_batched(
            model,
            |mut m| m.inject(&[lora()]).expect("inject"),
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn benchmark_state_dict(c: &mut Criterion) {
    let mut full = model();
    full.inject(&[lora()]).expect("inject");
    let mut peft = model();
    peft.inject(&[lora()]).expect("inject");
    peft.mark_setup_complete().expect("setup");

    let mut group = c.benchmark_group("state_dict");
    group.bench_function("full", |b| b.iter(|| full.state_dict().expect("state dict")));
    group.bench_function("adapters_only", |b| {
        b.iter(|| peft.state_dict().expect("state dict"));
    });
    group.finish();
}

criterion_group!(benches, benchmark_injection, benchmark_state_dict);
criterion_main!(benches);
