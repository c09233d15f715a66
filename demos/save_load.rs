//! Save and load adapter weights example.
//!
//! This example demonstrates:
//! - Building a GPT skeleton from a model configuration
//! - Injecting the `LoRA` adapters declared under `peft:`
//! - Saving only the adapter weights after setup
//! - Restoring them onto a fresh model and verifying they match

use std::sync::Arc;

use anyhow::Result;
use candle_core::Device;
use peft_shard::{LocalParallelState, PeftConfig, PeftModel};
use serde_yaml::Value;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = "
mcore_gpt: true
num_layers: 4
hidden_size: 128
num_attention_heads: 4
peft:
  peft_scheme: lora
  lora_tuning:
    adapter_dim: 8
    target_modules: [attention_qkv, mlp]
";

fn build(cfg: &Value) -> Result<PeftModel> {
    Ok(PeftModel::from_config(
        cfg.clone(),
        Arc::new(LocalParallelState::single()),
        &Device::Cpu,
    )?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Save and Load Adapter Weights Example ===\n");

    let cfg: Value = serde_yaml::from_str(CONFIG)?;
    let peft_cfgs = PeftConfig::from_model_config(&cfg)?;

    // Inject and finish setup
    let mut trained = build(&cfg)?;
    trained.inject(&peft_cfgs)?;
    trained.mark_setup_complete()?;
    println!("Parameters: {}", trained.summarize());
    println!("Adapter keys: {}", trained.adapter_keys().len());

    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("adapters.ckpt");
    trained.save_adapters(&path)?;
    println!("Saved adapters to {}", path.display());

    // Restore onto a fresh model
    let mut restored = build(&cfg)?;
    restored.load_adapters(&path, &peft_cfgs, Some(&Device::Cpu))?;
    restored.mark_setup_complete()?;

    let original = trained.state_dict()?;
    let loaded = restored.state_dict()?;
    let mut max_diff = 0f32;
    for (key, tensor) in &original {
        let diff = (tensor - &loaded[key])?.abs()?.max_all()?.to_scalar::<f32>()?;
        max_diff = max_diff.max(diff);
    }
    println!("Compared {} tensors, max abs diff {max_diff:.2e}", original.len());
    assert!(max_diff < 1e-6, "loaded weights differ");

    println!("\n=== Example completed successfully ===");
    Ok(())
}
