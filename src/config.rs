//! Configuration types.
//!
//! The persisted model configuration is a YAML document held as a
//! [`serde_yaml::Value`]; typed views ([`ModelOptions`], [`ModelDims`],
//! [`PeftSection`]) are read out of it with serde defaults. A [`PeftConfig`]
//! groups the adapters of one PEFT method together with method-wide policy.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::adapters::{
    names, AdapterConfig, AdapterKind, AdapterParams, InfusedConfig, InitMethod, NormPosition,
    ParallelLinearConfig, PromptEncoderConfig,
};
use crate::error::{PeftError, Result};
use crate::mixins::{MixinKind, NativeTarget};
use crate::naming::WrappingMode;
use crate::traits::Validate;

/// Look up a dotted path in a YAML mapping tree.
#[must_use]
pub fn get_path<'a>(cfg: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(cfg, |v, seg| v.get(seg))
}

/// Set a dotted path, creating intermediate mappings as needed.
///
/// # Errors
///
/// Returns [`PeftError::Configuration`] if an intermediate node exists but is
/// not a mapping.
pub fn set_path(cfg: &mut Value, path: &str, value: Value) -> Result<()> {
    let (parent, last) = path.rsplit_once('.').unwrap_or(("", path));
    mapping_at(cfg, parent)?.insert(Value::from(last), value);
    Ok(())
}

/// Mapping at a dotted path (`""` is the root), creating it and any missing
/// parents. Null nodes are replaced by empty mappings.
///
/// # Errors
///
/// Returns [`PeftError::Configuration`] if a node on the path is not a mapping.
pub fn mapping_at<'a>(cfg: &'a mut Value, path: &str) -> Result<&'a mut Mapping> {
    let mut node = cfg;
    if !path.is_empty() {
        for seg in path.split('.') {
            node = ensure_mapping(node, path)?
                .entry(Value::from(seg))
                .or_insert(Value::Null);
        }
    }
    ensure_mapping(node, path)
}

fn ensure_mapping<'a>(node: &'a mut Value, path: &str) -> Result<&'a mut Mapping> {
    if node.is_null() {
        *node = Value::Mapping(Mapping::new());
    }
    node.as_mapping_mut().ok_or_else(|| {
        PeftError::Configuration(format!("cannot set '{path}': not a mapping"))
    })
}

/// Runtime options read from the model configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Model runs on the pipeline-parallel-native runtime.
    pub mcore_gpt: bool,
    /// Model is wrapped for mixed precision / distributed optimizer.
    #[serde(rename = "megatron_amp_O2")]
    pub megatron_amp_o2: bool,
    /// Number of virtual pipeline chunks per stage.
    pub virtual_pipeline_model_parallel_size: Option<usize>,
}

impl ModelOptions {
    /// Read options from a model configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the known fields have the wrong types.
    pub fn from_config(cfg: &Value) -> Result<Self> {
        Ok(serde_yaml::from_value(cfg.clone())?)
    }

    /// Layout of the wrapped model implied by these options.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::Configuration`] when interleaving is combined with
    /// the mixed-precision wrapper.
    pub fn wrapping_mode(&self) -> Result<WrappingMode> {
        let interleaved = self
            .virtual_pipeline_model_parallel_size
            .is_some_and(|n| n > 1);
        match (interleaved, self.megatron_amp_o2) {
            (true, true) => Err(PeftError::Configuration(
                "interleaved pipeline with megatron_amp_O2 is not supported".into(),
            )),
            (true, false) => Ok(WrappingMode::Interleaved),
            (false, true) => Ok(WrappingMode::DistributedOptimizer),
            (false, false) => Ok(WrappingMode::Unwrapped),
        }
    }
}

/// Model dimensions used to size adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    /// Transformer hidden size.
    pub hidden_size: usize,
    /// MLP inner size; defaults to `4 * hidden_size`.
    #[serde(default)]
    pub ffn_hidden_size: Option<usize>,
    /// Attention heads.
    pub num_attention_heads: usize,
    /// Per-head width; defaults to `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub kv_channels: Option<usize>,
    /// Key/value groups for grouped-query attention; defaults to the head count.
    #[serde(default)]
    pub num_query_groups: Option<usize>,
}

impl ModelDims {
    /// Dimensions of a plain multi-head model.
    #[must_use]
    pub fn new(hidden_size: usize, num_attention_heads: usize) -> Self {
        Self {
            hidden_size,
            ffn_hidden_size: None,
            num_attention_heads,
            kv_channels: None,
            num_query_groups: None,
        }
    }

    /// Read dimensions from a model configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if `hidden_size` or `num_attention_heads` is missing.
    pub fn from_config(cfg: &Value) -> Result<Self> {
        let dims: Self = serde_yaml::from_value(cfg.clone())?;
        dims.validate()?;
        Ok(dims)
    }

    /// MLP inner size.
    #[must_use]
    pub fn ffn_hidden(&self) -> usize {
        self.ffn_hidden_size.unwrap_or(4 * self.hidden_size)
    }

    /// Per-head width.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.kv_channels
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Width of the query projection.
    #[must_use]
    pub fn projection_size(&self) -> usize {
        self.num_attention_heads * self.head_dim()
    }

    /// Width of one of the key or value projections.
    #[must_use]
    pub fn kv_projection_size(&self) -> usize {
        self.num_query_groups.unwrap_or(self.num_attention_heads) * self.head_dim()
    }

    /// Output width of the fused query/key/value projection.
    #[must_use]
    pub fn qkv_size(&self) -> usize {
        self.projection_size() + 2 * self.kv_projection_size()
    }
}

impl Validate for ModelDims {
    fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.num_attention_heads == 0 {
            return Err(PeftError::InvalidConfig(
                "hidden_size and num_attention_heads must be > 0".into(),
            ));
        }
        if self.kv_channels.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(PeftError::InvalidConfig(
                "hidden_size must be divisible by num_attention_heads".into(),
            ));
        }
        Ok(())
    }
}

/// `peft.lora_tuning` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraTuning {
    /// Rank.
    pub adapter_dim: usize,
    /// Scaling numerator (defaults to the rank, i.e. scaling 1).
    pub alpha: Option<f64>,
    /// Dropout on the adapter output.
    pub adapter_dropout: f64,
    /// Init of the down projection.
    pub column_init_method: InitMethod,
    /// Init of the up projection.
    pub row_init_method: InitMethod,
    /// Targets: `attention_qkv`, `attention_dense`, `mlp_fc1`, `mlp_fc2`,
    /// `attention`, `mlp` or `all`.
    pub target_modules: Vec<String>,
    /// Layer indices to adapt; all layers when absent.
    pub layer_selection: Option<Vec<usize>>,
    /// Share adapters across layers.
    pub weight_tying: bool,
}

impl Default for LoraTuning {
    fn default() -> Self {
        Self {
            adapter_dim: 32,
            alpha: None,
            adapter_dropout: 0.0,
            column_init_method: InitMethod::Xavier,
            row_init_method: InitMethod::Zero,
            target_modules: vec!["attention_qkv".into()],
            layer_selection: None,
            weight_tying: false,
        }
    }
}

/// `peft.p_tuning` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PTuning {
    /// Soft prompt length.
    pub virtual_tokens: usize,
    /// Hidden width of the reparameterization MLP.
    pub bottleneck_dim: usize,
    /// Width of the raw embeddings.
    pub embedding_dim: usize,
    /// Std of the embedding init.
    pub init_std: f64,
}

impl Default for PTuning {
    fn default() -> Self {
        Self {
            virtual_tokens: 10,
            bottleneck_dim: 1024,
            embedding_dim: 1024,
            init_std: 0.023,
        }
    }
}

/// `peft.adapter_tuning` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterTuning {
    /// Bottleneck width.
    pub adapter_dim: usize,
    /// Dropout on the adapter output.
    pub adapter_dropout: f64,
    /// Layer norm placement.
    pub norm_position: NormPosition,
    /// Init of the down projection.
    pub column_init_method: InitMethod,
    /// Init of the up projection.
    pub row_init_method: InitMethod,
    /// Layer indices to adapt; all layers when absent.
    pub layer_selection: Option<Vec<usize>>,
    /// Share adapters across layers.
    pub weight_tying: bool,
}

impl Default for AdapterTuning {
    fn default() -> Self {
        Self {
            adapter_dim: 32,
            adapter_dropout: 0.0,
            norm_position: NormPosition::Pre,
            column_init_method: InitMethod::Xavier,
            row_init_method: InitMethod::Zero,
            layer_selection: None,
            weight_tying: false,
        }
    }
}

/// `peft.ia3_tuning` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ia3Tuning {
    /// Layer indices to adapt; all layers when absent.
    pub layer_selection: Option<Vec<usize>>,
}

/// The `peft` section of a model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeftSection {
    /// Comma-separated method names: `lora`, `ptuning`, `adapter`, `ia3`, `none`.
    pub peft_scheme: String,
    /// LoRA settings.
    pub lora_tuning: LoraTuning,
    /// P-Tuning settings.
    pub p_tuning: PTuning,
    /// Canonical adapter settings.
    pub adapter_tuning: AdapterTuning,
    /// IA3 settings.
    pub ia3_tuning: Ia3Tuning,
}

impl Default for PeftSection {
    fn default() -> Self {
        Self {
            peft_scheme: "lora".into(),
            lora_tuning: LoraTuning::default(),
            p_tuning: PTuning::default(),
            adapter_tuning: AdapterTuning::default(),
            ia3_tuning: Ia3Tuning::default(),
        }
    }
}

/// PEFT method of a [`PeftConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeftMethod {
    /// Low-rank adaptation.
    Lora,
    /// Prompt encoder on the input embeddings.
    Ptuning,
    /// Bottleneck adapters around attention.
    CanonicalAdapters,
    /// Learned activation rescaling.
    Ia3,
}

/// One PEFT method's adapters plus method-wide policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PeftConfig {
    /// PEFT method.
    pub method: PeftMethod,
    /// Adapters to inject, in order.
    pub adapters: Vec<AdapterConfig>,
    /// Layer indices to adapt; all layers when `None`.
    pub layer_selection: Option<BTreeSet<usize>>,
    /// Share adapter parameters across layers.
    pub weight_tying: bool,
    /// Adapter name to native-runtime targets; `None` means the method is not
    /// supported on the native runtime.
    pub native_targets: Option<BTreeMap<String, Vec<NativeTarget>>>,
    /// Soft prompt length (P-Tuning only).
    pub virtual_tokens: Option<usize>,
}

impl PeftConfig {
    /// LoRA adapters for the requested targets.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid dimensions or an unknown target module
    /// name.
    pub fn lora(dims: &ModelDims, tuning: &LoraTuning) -> Result<Self> {
        dims.validate()?;
        let lora = |in_features, out_features| {
            AdapterParams::ParallelLinear(ParallelLinearConfig {
                column_init_method: tuning.column_init_method,
                row_init_method: tuning.row_init_method,
                alpha: tuning.alpha,
                dropout: tuning.adapter_dropout,
                ..ParallelLinearConfig::new(in_features, out_features, tuning.adapter_dim)
            })
        };

        let mut kinds = BTreeSet::new();
        for target in &tuning.target_modules {
            match target.as_str() {
                "attention_qkv" => {
                    kinds.insert(AdapterKind::LoraKqv);
                }
                "attention_dense" => {
                    kinds.insert(AdapterKind::LoraDenseAttention);
                }
                "mlp_fc1" => {
                    kinds.insert(AdapterKind::LoraHto4h);
                }
                "mlp_fc2" => {
                    kinds.insert(AdapterKind::Lora4htoH);
                }
                "attention" => {
                    kinds.extend([AdapterKind::LoraKqv, AdapterKind::LoraDenseAttention]);
                }
                "mlp" => {
                    kinds.extend([AdapterKind::LoraHto4h, AdapterKind::Lora4htoH]);
                }
                "all" => {
                    kinds.extend([
                        AdapterKind::LoraKqv,
                        AdapterKind::LoraDenseAttention,
                        AdapterKind::LoraHto4h,
                        AdapterKind::Lora4htoH,
                    ]);
                }
                other => {
                    return Err(PeftError::Configuration(format!(
                        "unknown LoRA target module '{other}'"
                    )))
                }
            }
        }

        let mut adapters = Vec::new();
        let mut native_targets = BTreeMap::new();
        for kind in kinds {
            let (name, params, target) = match kind {
                AdapterKind::LoraKqv => (
                    names::LORA_KQV,
                    lora(dims.hidden_size, dims.qkv_size()),
                    NativeTarget::new("self_attention", MixinKind::SelfAttention),
                ),
                AdapterKind::LoraDenseAttention => (
                    names::LORA_DENSE_ATTENTION,
                    lora(dims.projection_size(), dims.hidden_size),
                    NativeTarget::new("self_attention", MixinKind::SelfAttention),
                ),
                AdapterKind::LoraHto4h => (
                    names::LORA_HTO4H,
                    lora(dims.hidden_size, dims.ffn_hidden()),
                    NativeTarget::new("mlp", MixinKind::Mlp),
                ),
                _ => (
                    names::LORA_4HTOH,
                    lora(dims.ffn_hidden(), dims.hidden_size),
                    NativeTarget::new("mlp", MixinKind::Mlp),
                ),
            };
            adapters.push(AdapterConfig::new(name, kind, params));
            native_targets.insert(name.to_string(), vec![target]);
        }

        Ok(Self {
            method: PeftMethod::Lora,
            adapters,
            layer_selection: selection(tuning.layer_selection.as_deref()),
            weight_tying: tuning.weight_tying,
            native_targets: Some(native_targets),
            virtual_tokens: None,
        })
    }

    /// P-Tuning prompt encoder. Only the first pipeline stage receives it.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::InvalidConfig`] on invalid dimensions.
    pub fn ptuning(dims: &ModelDims, tuning: &PTuning) -> Result<Self> {
        dims.validate()?;
        let params = AdapterParams::PromptEncoder(PromptEncoderConfig {
            virtual_tokens: tuning.virtual_tokens,
            bottleneck_dim: tuning.bottleneck_dim,
            embedding_dim: tuning.embedding_dim,
            output_dim: dims.hidden_size,
            init_std: tuning.init_std,
        });
        Ok(Self {
            method: PeftMethod::Ptuning,
            adapters: vec![AdapterConfig::new(names::PTUNING, AdapterKind::PromptEncoder, params)],
            layer_selection: None,
            weight_tying: false,
            native_targets: Some(BTreeMap::from([(
                names::PTUNING.to_string(),
                vec![NativeTarget::new("embedding", MixinKind::Embedding)],
            )])),
            virtual_tokens: Some(tuning.virtual_tokens),
        })
    }

    /// Canonical pre- and post-attention bottleneck adapters on every layer.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::InvalidConfig`] on invalid dimensions.
    pub fn canonical_adapters(dims: &ModelDims, tuning: &AdapterTuning) -> Result<Self> {
        dims.validate()?;
        let params = AdapterParams::ParallelLinear(ParallelLinearConfig {
            activation: Some(candle_nn::Activation::Swish),
            norm_position: tuning.norm_position,
            column_init_method: tuning.column_init_method,
            row_init_method: tuning.row_init_method,
            dropout: tuning.adapter_dropout,
            ..ParallelLinearConfig::new(dims.hidden_size, dims.hidden_size, tuning.adapter_dim)
        });
        let adapters = [names::PRE_ATTN, names::POST_ATTN]
            .into_iter()
            .map(|name| AdapterConfig::new(name, AdapterKind::ParallelLinear, params.clone()))
            .collect();
        let native_targets = [names::PRE_ATTN, names::POST_ATTN]
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    vec![NativeTarget::new("", MixinKind::TransformerLayer)],
                )
            })
            .collect();
        Ok(Self {
            method: PeftMethod::CanonicalAdapters,
            adapters,
            layer_selection: selection(tuning.layer_selection.as_deref()),
            weight_tying: tuning.weight_tying,
            native_targets: Some(native_targets),
            virtual_tokens: None,
        })
    }

    /// IA3 key, value and MLP scalers.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::InvalidConfig`] on invalid dimensions.
    pub fn ia3(dims: &ModelDims, tuning: &Ia3Tuning) -> Result<Self> {
        dims.validate()?;
        let infused = |in_features| AdapterParams::Infused(InfusedConfig { in_features });
        let adapters = vec![
            AdapterConfig::new(names::KEY_INFUSED, AdapterKind::Infused, infused(dims.kv_projection_size())),
            AdapterConfig::new(names::VALUE_INFUSED, AdapterKind::Infused, infused(dims.kv_projection_size())),
            AdapterConfig::new(names::MLP_INFUSED, AdapterKind::MlpInfused, infused(dims.ffn_hidden())),
        ];
        let attention = NativeTarget::new("self_attention", MixinKind::SelfAttention);
        let native_targets = BTreeMap::from([
            (names::KEY_INFUSED.to_string(), vec![attention.clone()]),
            (names::VALUE_INFUSED.to_string(), vec![attention]),
            (
                names::MLP_INFUSED.to_string(),
                vec![NativeTarget::new("mlp", MixinKind::Mlp)],
            ),
        ]);
        Ok(Self {
            method: PeftMethod::Ia3,
            adapters,
            layer_selection: selection(tuning.layer_selection.as_deref()),
            weight_tying: false,
            native_targets: Some(native_targets),
            virtual_tokens: None,
        })
    }

    /// Build the PEFT configs named by `peft.peft_scheme` in a model configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on an unknown scheme or malformed section.
    pub fn from_model_config(cfg: &Value) -> Result<Vec<Self>> {
        let dims = ModelDims::from_config(cfg)?;
        let section: PeftSection = match cfg.get("peft") {
            Some(peft) => serde_yaml::from_value(peft.clone())?,
            None => PeftSection::default(),
        };
        let mut configs = Vec::new();
        for scheme in section.peft_scheme.split(',').map(str::trim) {
            match scheme {
                "lora" => configs.push(Self::lora(&dims, &section.lora_tuning)?),
                "ptuning" => configs.push(Self::ptuning(&dims, &section.p_tuning)?),
                "adapter" => configs.push(Self::canonical_adapters(&dims, &section.adapter_tuning)?),
                "ia3" => configs.push(Self::ia3(&dims, &section.ia3_tuning)?),
                "none" | "" => {}
                other => {
                    return Err(PeftError::Configuration(format!(
                        "unknown peft_scheme '{other}'"
                    )))
                }
            }
        }
        Ok(configs)
    }

    /// Restrict adaptation to the given layer indices.
    #[must_use]
    pub fn with_layer_selection(mut self, layers: impl IntoIterator<Item = usize>) -> Self {
        self.layer_selection = Some(layers.into_iter().collect());
        self
    }

    /// Enable or disable weight tying.
    #[must_use]
    pub fn with_weight_tying(mut self, weight_tying: bool) -> Self {
        self.weight_tying = weight_tying;
        self
    }

    /// Drop the native target table, marking the method as unsupported on the
    /// native runtime.
    #[must_use]
    pub fn without_native_targets(mut self) -> Self {
        self.native_targets = None;
        self
    }

    /// Whether the adapter must only be placed on the first pipeline stage.
    #[must_use]
    pub fn first_stage_only(&self) -> bool {
        self.method == PeftMethod::Ptuning
    }
}

impl Validate for PeftConfig {
    fn validate(&self) -> Result<()> {
        for adapter in &self.adapters {
            adapter.validate()?;
        }
        if let Some(targets) = &self.native_targets {
            for name in targets.keys() {
                if !self.adapters.iter().any(|a| &a.name == name) {
                    return Err(PeftError::InvalidConfig(format!(
                        "native target for unknown adapter '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn selection(layers: Option<&[usize]>) -> Option<BTreeSet<usize>> {
    layers.map(|l| l.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> ModelDims {
        ModelDims::new(64, 4)
    }

    #[test]
    fn test_get_and_set_path() -> Result<()> {
        let mut cfg: Value = serde_yaml::from_str("a:\n  b: 1\n")?;
        assert_eq!(get_path(&cfg, "a.b"), Some(&Value::from(1)));
        set_path(&mut cfg, "a.c.d", Value::from("x"))?;
        assert_eq!(get_path(&cfg, "a.c.d"), Some(&Value::from("x")));
        assert!(set_path(&mut cfg, "a.b.e", Value::from(2)).is_err());
        Ok(())
    }

    #[test]
    fn test_wrapping_mode() -> Result<()> {
        let cfg: Value = serde_yaml::from_str("megatron_amp_O2: true\nmcore_gpt: true\n")?;
        let options = ModelOptions::from_config(&cfg)?;
        assert!(options.mcore_gpt);
        assert_eq!(options.wrapping_mode()?, WrappingMode::DistributedOptimizer);

        let cfg: Value = serde_yaml::from_str("virtual_pipeline_model_parallel_size: 2\n")?;
        assert_eq!(ModelOptions::from_config(&cfg)?.wrapping_mode()?, WrappingMode::Interleaved);

        let cfg: Value = serde_yaml::from_str(
            "virtual_pipeline_model_parallel_size: 2\nmegatron_amp_O2: true\n",
        )?;
        assert!(ModelOptions::from_config(&cfg)?.wrapping_mode().is_err());
        Ok(())
    }

    #[test]
    fn test_model_dims() -> Result<()> {
        let cfg: Value = serde_yaml::from_str(
            "hidden_size: 64\nnum_attention_heads: 8\nnum_query_groups: 2\nffn_hidden_size: 128\n",
        )?;
        let dims = ModelDims::from_config(&cfg)?;
        assert_eq!(dims.head_dim(), 8);
        assert_eq!(dims.qkv_size(), 64 + 2 * 16);
        assert_eq!(dims.ffn_hidden(), 128);
        Ok(())
    }

    #[test]
    fn test_lora_targets() -> Result<()> {
        let tuning = LoraTuning {
            target_modules: vec!["attention".into(), "mlp_fc1".into()],
            ..LoraTuning::default()
        };
        let cfg = PeftConfig::lora(&dims(), &tuning)?;
        let names: Vec<_> = cfg.adapters.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![names::LORA_KQV, names::LORA_DENSE_ATTENTION, names::LORA_HTO4H]
        );
        let targets = cfg.native_targets.as_ref().map(BTreeMap::len);
        assert_eq!(targets, Some(3));
        assert!(cfg.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_lora_unknown_target() {
        let tuning = LoraTuning {
            target_modules: vec!["embedding".into()],
            ..LoraTuning::default()
        };
        assert!(matches!(
            PeftConfig::lora(&dims(), &tuning),
            Err(PeftError::Configuration(_))
        ));
    }

    #[test]
    fn test_constructors_reject_zero_heads() {
        let bad = ModelDims::new(16, 0);
        let results = [
            PeftConfig::lora(&bad, &LoraTuning::default()),
            PeftConfig::ptuning(&bad, &PTuning::default()),
            PeftConfig::canonical_adapters(&bad, &AdapterTuning::default()),
            PeftConfig::ia3(&bad, &Ia3Tuning::default()),
        ];
        for result in results {
            assert!(matches!(result, Err(PeftError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_from_model_config() -> Result<()> {
        let cfg: Value = serde_yaml::from_str(
            r"
hidden_size: 64
num_attention_heads: 4
peft:
  peft_scheme: adapter, ptuning
  adapter_tuning:
    adapter_dim: 8
    layer_selection: [0, 2]
    weight_tying: true
  p_tuning:
    virtual_tokens: 5
",
        )?;
        let configs = PeftConfig::from_model_config(&cfg)?;
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].method, PeftMethod::CanonicalAdapters);
        assert_eq!(configs[0].layer_selection, Some(BTreeSet::from([0, 2])));
        assert!(configs[0].weight_tying);
        assert_eq!(configs[1].virtual_tokens, Some(5));
        assert!(configs[1].first_stage_only());
        Ok(())
    }

    #[test]
    fn test_unknown_scheme() -> Result<()> {
        let cfg: Value =
            serde_yaml::from_str("hidden_size: 64\nnum_attention_heads: 4\npeft:\n  peft_scheme: prefix\n")?;
        assert!(PeftConfig::from_model_config(&cfg).is_err());
        Ok(())
    }
}
