//! Shared fixtures for unit tests.

use std::sync::Arc;

use serde_yaml::Value;

use crate::config::{LoraTuning, ModelDims, PeftConfig};
use crate::error::Result;
use crate::model::PeftModel;
use crate::parallel::LocalParallelState;
use crate::skeleton::GptSkeleton;

pub(crate) fn dims() -> ModelDims {
    ModelDims::new(16, 2)
}

/// Two-layer model config plus `extra` YAML lines.
pub(crate) fn cfg_yaml(extra: &str) -> Value {
    let text = format!("hidden_size: 16\nnum_attention_heads: 2\nnum_layers: 2\n{extra}");
    serde_yaml::from_str(&text).expect("fixture config is valid yaml")
}

pub(crate) fn native_model(layers: usize) -> Result<PeftModel> {
    let model = GptSkeleton::new(dims(), layers).build()?;
    PeftModel::new(model, cfg_yaml("mcore_gpt: true\n"), Arc::new(LocalParallelState::single()))
}

/// LoRA on the fused qkv projection with rank 4.
pub(crate) fn lora() -> Result<PeftConfig> {
    PeftConfig::lora(
        &dims(),
        &LoraTuning {
            adapter_dim: 4,
            ..LoraTuning::default()
        },
    )
}
