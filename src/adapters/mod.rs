//! Adapter implementations and their configuration records.
//!
//! Adapters are addressed two ways: by implementation [`AdapterKind`] (what a
//! host module checks against its accepted types) and by adapter name (the key
//! under which the host stores the instance, e.g. `lora_kqv_adapter`).

pub mod infused;
pub mod parallel_linear;
pub mod prompt_encoder;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{PeftError, Result};
use crate::traits::{Adapter, Validate};

pub use infused::{InfusedAdapter, InfusedConfig};
pub use parallel_linear::{InitMethod, NormPosition, ParallelLinearAdapter, ParallelLinearConfig};
pub use prompt_encoder::{PromptEncoderAdapter, PromptEncoderConfig};

/// Conventional adapter names.
pub mod names {
    /// LoRA on the fused query/key/value projection.
    pub const LORA_KQV: &str = "lora_kqv_adapter";
    /// LoRA on the attention output projection.
    pub const LORA_DENSE_ATTENTION: &str = "lora_dense_attention_adapter";
    /// LoRA on the first MLP projection.
    pub const LORA_HTO4H: &str = "lora_hto4h_adapter";
    /// LoRA on the second MLP projection.
    pub const LORA_4HTOH: &str = "lora_4htoh_adapter";
    /// Canonical adapter before attention.
    pub const PRE_ATTN: &str = "adapter_1";
    /// Canonical adapter after attention.
    pub const POST_ATTN: &str = "adapter_2";
    /// IA3 key scaler.
    pub const KEY_INFUSED: &str = "key_infused_adapter";
    /// IA3 value scaler.
    pub const VALUE_INFUSED: &str = "value_infused_adapter";
    /// IA3 MLP scaler.
    pub const MLP_INFUSED: &str = "mlp_infused_adapter";
    /// P-Tuning prompt encoder.
    pub const PTUNING: &str = "ptuning_adapter";
}

/// Adapter implementation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AdapterKind {
    /// Low-rank update of the query/key/value projection.
    #[serde(rename = "LoraKQVAdapter")]
    LoraKqv,
    /// Low-rank update of the attention output projection.
    #[serde(rename = "LoraDenseAttentionAdapter")]
    LoraDenseAttention,
    /// Low-rank update of the MLP up projection.
    #[serde(rename = "LoraHto4HAdapter")]
    LoraHto4h,
    /// Low-rank update of the MLP down projection.
    #[serde(rename = "Lora4HtoHAdapter")]
    Lora4htoH,
    /// Canonical bottleneck adapter.
    #[serde(rename = "ParallelLinearAdapter")]
    ParallelLinear,
    /// IA3 attention scaler.
    #[serde(rename = "InfusedAdapter")]
    Infused,
    /// IA3 MLP scaler.
    #[serde(rename = "MLPInfusedAdapter")]
    MlpInfused,
    /// P-Tuning prompt encoder.
    #[serde(rename = "PromptEncoderAdapter")]
    PromptEncoder,
}

impl AdapterKind {
    /// Whether this kind only contributes parameters on the first pipeline stage.
    #[must_use]
    pub fn first_stage_only(self) -> bool {
        matches!(self, Self::PromptEncoder)
    }

    fn family(self) -> &'static str {
        match self {
            Self::LoraKqv
            | Self::LoraDenseAttention
            | Self::LoraHto4h
            | Self::Lora4htoH
            | Self::ParallelLinear => "parallel_linear",
            Self::Infused | Self::MlpInfused => "infused",
            Self::PromptEncoder => "prompt_encoder",
        }
    }
}

/// Hyperparameters of one adapter, by implementation family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum AdapterParams {
    /// Two-projection bottleneck (LoRA and canonical adapters).
    ParallelLinear(ParallelLinearConfig),
    /// Learned rescaling vector (IA3).
    Infused(InfusedConfig),
    /// Prompt encoder (P-Tuning).
    PromptEncoder(PromptEncoderConfig),
}

impl AdapterParams {
    fn family(&self) -> &'static str {
        match self {
            Self::ParallelLinear(_) => "parallel_linear",
            Self::Infused(_) => "infused",
            Self::PromptEncoder(_) => "prompt_encoder",
        }
    }
}

/// One adapter to inject: its name, implementation kind and hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Name under which hosts store the adapter.
    pub name: String,
    /// Implementation kind.
    #[serde(rename = "_target_")]
    pub kind: AdapterKind,
    /// Hyperparameters.
    pub params: AdapterParams,
}

impl AdapterConfig {
    /// Create a new adapter configuration.
    pub fn new(name: impl Into<String>, kind: AdapterKind, params: AdapterParams) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
        }
    }
}

impl Validate for AdapterConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PeftError::InvalidConfig("adapter name cannot be empty".into()));
        }
        if self.kind.family() != self.params.family() {
            return Err(PeftError::InvalidConfig(format!(
                "adapter '{}' of kind {:?} cannot use {} parameters",
                self.name,
                self.kind,
                self.params.family()
            )));
        }
        match &self.params {
            AdapterParams::ParallelLinear(p) => p.validate(),
            AdapterParams::Infused(p) => p.validate(),
            AdapterParams::PromptEncoder(p) => p.validate(),
        }
    }
}

/// Instantiate the adapter described by `cfg`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or tensor creation fails.
pub fn build(cfg: &AdapterConfig, device: &Device) -> Result<Box<dyn Adapter>> {
    cfg.validate()?;
    let adapter: Box<dyn Adapter> = match &cfg.params {
        AdapterParams::ParallelLinear(p) => {
            Box::new(ParallelLinearAdapter::new(cfg.kind, p.clone(), device)?)
        }
        AdapterParams::Infused(p) => Box::new(InfusedAdapter::new(cfg.kind, p.clone(), device)?),
        AdapterParams::PromptEncoder(p) => Box::new(PromptEncoderAdapter::new(p.clone(), device)?),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_family_mismatch_rejected() {
        let cfg = AdapterConfig::new(
            names::LORA_KQV,
            AdapterKind::LoraKqv,
            AdapterParams::Infused(InfusedConfig { in_features: 8 }),
        );
        assert!(matches!(cfg.validate(), Err(PeftError::InvalidConfig(_))));
    }

    #[test]
    fn test_first_stage_only() {
        assert!(AdapterKind::PromptEncoder.first_stage_only());
        assert!(!AdapterKind::LoraKqv.first_stage_only());
    }

    #[test]
    fn test_config_yaml_uses_target_key() -> anyhow::Result<()> {
        let cfg = AdapterConfig::new(
            names::KEY_INFUSED,
            AdapterKind::Infused,
            AdapterParams::Infused(InfusedConfig { in_features: 16 }),
        );
        let yaml = serde_yaml::to_string(&cfg)?;
        assert!(yaml.contains("_target_: InfusedAdapter"));
        assert!(yaml.contains("family: infused"));
        let back: AdapterConfig = serde_yaml::from_str(&yaml)?;
        assert_eq!(back, cfg);
        Ok(())
    }

    #[test]
    fn test_build_dispatches_on_params() -> Result<()> {
        let cfg = AdapterConfig::new(
            names::MLP_INFUSED,
            AdapterKind::MlpInfused,
            AdapterParams::Infused(InfusedConfig { in_features: 32 }),
        );
        let adapter = build(&cfg, &Device::Cpu)?;
        assert_eq!(adapter.kind(), AdapterKind::MlpInfused);
        assert_eq!(adapter.num_parameters(), 32);
        Ok(())
    }
}
