//! Parameter skeleton of a GPT model.
//!
//! Stands in for the external transformer: it has the module paths, parameter
//! shapes, adapter hosts and `pre_process` hint of the real model, but no
//! forward pass. Two layouts are supported:
//!
//! - native: `embedding`, `decoder.layers.<i>.{self_attention,mlp}`,
//!   `decoder.final_layernorm`, `output_layer`. No module is adapter-capable
//!   until a mixin is swapped in.
//! - legacy: `language_model.embedding`, `language_model.encoder.layers.<i>`.
//!   Embedding, layers, attention and MLP blocks carry adapter hosts from
//!   construction.

use candle_core::{DType, Device, Tensor};
use serde_yaml::Value;

use crate::adapters::AdapterKind;
use crate::config::{ModelDims, ModelOptions};
use crate::error::{PeftError, Result};
use crate::module::Module;
use crate::naming::{WrappingMode, WRAPPER_SEGMENT};

/// Path of the layer list inside a native core model.
pub const NATIVE_LAYERS: &str = "decoder.layers";
/// Path of the layer list inside a legacy core model.
pub const LEGACY_LAYERS: &str = "language_model.encoder.layers";

/// Builder for GPT parameter skeletons.
#[derive(Debug, Clone)]
pub struct GptSkeleton {
    dims: ModelDims,
    num_layers: usize,
    vocab_size: usize,
    native: bool,
    wrapping: WrappingMode,
    virtual_chunks: usize,
    pre_process: bool,
    device: Device,
}

impl GptSkeleton {
    /// Native-layout skeleton with `num_layers` layers on the CPU.
    #[must_use]
    pub fn new(dims: ModelDims, num_layers: usize) -> Self {
        Self {
            dims,
            num_layers,
            vocab_size: 128,
            native: true,
            wrapping: WrappingMode::Unwrapped,
            virtual_chunks: 1,
            pre_process: true,
            device: Device::Cpu,
        }
    }

    /// Skeleton described by a model configuration document
    /// (`num_layers`, dimensions, `mcore_gpt`, wrapping options).
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing or the options are inconsistent.
    pub fn from_config(cfg: &Value) -> Result<Self> {
        let dims = ModelDims::from_config(cfg)?;
        let options = ModelOptions::from_config(cfg)?;
        let num_layers = cfg
            .get("num_layers")
            .and_then(Value::as_u64)
            .ok_or_else(|| PeftError::Configuration("num_layers is required".into()))?;
        let num_layers = usize::try_from(num_layers)
            .map_err(|_| PeftError::Configuration("num_layers out of range".into()))?;
        let mut skeleton = Self::new(dims, num_layers)
            .native(options.mcore_gpt)
            .wrapping(options.wrapping_mode()?);
        if let Some(chunks) = options.virtual_pipeline_model_parallel_size {
            skeleton = skeleton.virtual_chunks(chunks);
        }
        if let Some(vocab) = cfg.get("vocab_size").and_then(Value::as_u64) {
            skeleton.vocab_size = usize::try_from(vocab)
                .map_err(|_| PeftError::Configuration("vocab_size out of range".into()))?;
        }
        Ok(skeleton)
    }

    /// Choose the native (`true`) or legacy layout.
    #[must_use]
    pub fn native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    /// Set the wrapping mode.
    #[must_use]
    pub fn wrapping(mut self, wrapping: WrappingMode) -> Self {
        self.wrapping = wrapping;
        self
    }

    /// Number of virtual pipeline chunks in the interleaved layout.
    #[must_use]
    pub fn virtual_chunks(mut self, chunks: usize) -> Self {
        self.virtual_chunks = chunks;
        self
    }

    /// Whether this stage holds the input embeddings.
    #[must_use]
    pub fn pre_process(mut self, pre_process: bool) -> Self {
        self.pre_process = pre_process;
        self
    }

    /// Vocabulary size of the embedding and output layer.
    #[must_use]
    pub fn vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    /// Device holding the parameters.
    #[must_use]
    pub fn device(mut self, device: &Device) -> Self {
        self.device = device.clone();
        self
    }

    /// Build the module registered under `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interleaved layout cannot split the layers
    /// evenly or tensor creation fails.
    pub fn build(&self) -> Result<Module> {
        match self.wrapping {
            WrappingMode::Unwrapped => self.core(0, self.num_layers, self.pre_process, true),
            WrappingMode::DistributedOptimizer => Ok(Module::new("Float16Module")
                .with_child(WRAPPER_SEGMENT, self.core(0, self.num_layers, self.pre_process, true)?)),
            WrappingMode::Interleaved => {
                let chunks = self.virtual_chunks;
                if chunks == 0 || self.num_layers % chunks != 0 {
                    return Err(PeftError::Configuration(format!(
                        "{} layers cannot be split into {chunks} virtual chunks",
                        self.num_layers
                    )));
                }
                let per_chunk = self.num_layers / chunks;
                let mut list = Module::new("ModuleList");
                for i in 0..chunks {
                    let chunk = self.core(
                        i * per_chunk,
                        per_chunk,
                        self.pre_process && i == 0,
                        i + 1 == chunks,
                    )?;
                    list = list.with_child(i.to_string(), chunk);
                }
                Ok(list)
            }
        }
    }

    fn core(&self, first_layer: usize, layers: usize, pre_process: bool, post_process: bool) -> Result<Module> {
        if self.native {
            self.native_core(first_layer, layers, pre_process, post_process)
        } else {
            self.legacy_core(first_layer, layers, pre_process, post_process)
        }
    }

    fn native_core(&self, first_layer: usize, layers: usize, pre_process: bool, post_process: bool) -> Result<Module> {
        let h = self.dims.hidden_size;
        let mut core = Module::new("GPTModel").with_pre_process(pre_process);
        if pre_process {
            core = core.with_child(
                "embedding",
                Module::new("LanguageModelEmbedding")
                    .with_child("word_embeddings", self.linear("VocabParallelEmbedding", self.vocab_size, h)?),
            );
        }

        let mut list = Module::new("ModuleList");
        for i in 0..layers {
            let layer = Module::new("TransformerLayer")
                .with_child("input_layernorm", self.norm("FusedLayerNorm")?)
                .with_child(
                    "self_attention",
                    Module::new("SelfAttention")
                        .with_child("linear_qkv", self.linear("ColumnParallelLinear", self.dims.qkv_size(), h)?)
                        .with_child("linear_proj", self.linear("RowParallelLinear", h, self.dims.projection_size())?),
                )
                .with_child("pre_mlp_layernorm", self.norm("FusedLayerNorm")?)
                .with_child(
                    "mlp",
                    Module::new("MLP")
                        .with_child("linear_fc1", self.linear("ColumnParallelLinear", self.dims.ffn_hidden(), h)?)
                        .with_child("linear_fc2", self.linear("RowParallelLinear", h, self.dims.ffn_hidden())?),
                );
            tracing::trace!(layer = first_layer + i, "built native layer");
            list = list.with_child(i.to_string(), layer);
        }
        let mut decoder = Module::new("TransformerBlock").with_child("layers", list);
        if post_process {
            decoder = decoder.with_child("final_layernorm", self.norm("FusedLayerNorm")?);
            core = core
                .with_child("decoder", decoder)
                .with_child("output_layer", self.linear("ColumnParallelLinear", self.vocab_size, h)?);
        } else {
            core = core.with_child("decoder", decoder);
        }
        Ok(core)
    }

    fn legacy_core(&self, first_layer: usize, layers: usize, pre_process: bool, post_process: bool) -> Result<Module> {
        let h = self.dims.hidden_size;
        let mut language_model = Module::new("TransformerLanguageModel");
        if pre_process {
            language_model = language_model.with_child(
                "embedding",
                Module::new("Embedding")
                    .with_child("word_embeddings", self.linear("VocabParallelEmbedding", self.vocab_size, h)?)
                    .with_adapter_support(&[AdapterKind::PromptEncoder]),
            );
        }

        let mut list = Module::new("ModuleList");
        for i in 0..layers {
            let layer = Module::new("ParallelTransformerLayer")
                .with_child("input_layernorm", self.norm("MixedFusedLayerNorm")?)
                .with_child(
                    "self_attention",
                    Module::new("ParallelAttention")
                        .with_child("query_key_value", self.linear("ColumnParallelLinear", self.dims.qkv_size(), h)?)
                        .with_child("dense", self.linear("RowParallelLinear", h, self.dims.projection_size())?)
                        .with_adapter_support(&[
                            AdapterKind::LoraKqv,
                            AdapterKind::LoraDenseAttention,
                            AdapterKind::Infused,
                        ]),
                )
                .with_child("post_attention_layernorm", self.norm("MixedFusedLayerNorm")?)
                .with_child(
                    "mlp",
                    Module::new("ParallelMLP")
                        .with_child("dense_h_to_4h", self.linear("ColumnParallelLinear", self.dims.ffn_hidden(), h)?)
                        .with_child("dense_4h_to_h", self.linear("RowParallelLinear", h, self.dims.ffn_hidden())?)
                        .with_adapter_support(&[
                            AdapterKind::LoraHto4h,
                            AdapterKind::Lora4htoH,
                            AdapterKind::MlpInfused,
                        ]),
                )
                .with_adapter_support(&[AdapterKind::ParallelLinear]);
            tracing::trace!(layer = first_layer + i, "built legacy layer");
            list = list.with_child(i.to_string(), layer);
        }
        let mut encoder = Module::new("ParallelTransformer").with_child("layers", list);
        if post_process {
            encoder = encoder.with_child("final_layernorm", self.norm("MixedFusedLayerNorm")?);
        }
        language_model = language_model.with_child("encoder", encoder);
        Ok(Module::new("GPTModel")
            .with_pre_process(pre_process)
            .with_child("language_model", language_model))
    }

    fn linear(&self, kind: &str, out_dim: usize, in_dim: usize) -> Result<Module> {
        Module::new(kind).with_param(
            "weight",
            &Tensor::randn(0f32, 0.02, (out_dim, in_dim), &self.device)?,
        )
    }

    fn norm(&self, kind: &str) -> Result<Module> {
        let h = self.dims.hidden_size;
        Module::new(kind)
            .with_param("weight", &Tensor::ones(h, DType::F32, &self.device)?)?
            .with_param("bias", &Tensor::zeros(h, DType::F32, &self.device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::join_path;

    fn dims() -> ModelDims {
        ModelDims::new(16, 2)
    }

    fn keys(module: &Module) -> Vec<String> {
        module
            .named_parameters("model")
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    }

    #[test]
    fn test_native_layout() -> Result<()> {
        let model = GptSkeleton::new(dims(), 2).build()?;
        let keys = keys(&model);
        assert!(keys.contains(&"model.embedding.word_embeddings.weight".to_string()));
        assert!(keys.contains(&"model.decoder.layers.1.self_attention.linear_qkv.weight".to_string()));
        assert!(keys.contains(&"model.output_layer.weight".to_string()));
        assert_eq!(model.pre_process(), Some(true));
        assert!(model
            .submodule(&join_path(NATIVE_LAYERS, "0.self_attention"))
            .is_some_and(|m| m.host().is_none()));
        Ok(())
    }

    #[test]
    fn test_legacy_layout_has_hosts() -> Result<()> {
        let model = GptSkeleton::new(dims(), 1).native(false).build()?;
        let attention = model.submodule("language_model.encoder.layers.0.self_attention");
        assert!(attention.is_some_and(|m| m.host().is_some()));
        assert!(model.submodule("language_model.embedding").is_some_and(|m| m.host().is_some()));
        Ok(())
    }

    #[test]
    fn test_distributed_optimizer_wrapper() -> Result<()> {
        let model = GptSkeleton::new(dims(), 1)
            .wrapping(WrappingMode::DistributedOptimizer)
            .build()?;
        assert!(keys(&model).iter().all(|k| k.starts_with("model.module.")));
        assert_eq!(model.pre_process(), None);
        assert_eq!(model.child(WRAPPER_SEGMENT).and_then(Module::pre_process), Some(true));
        Ok(())
    }

    #[test]
    fn test_interleaved_chunks() -> Result<()> {
        let model = GptSkeleton::new(dims(), 4)
            .wrapping(WrappingMode::Interleaved)
            .virtual_chunks(2)
            .build()?;
        let keys = keys(&model);
        assert!(keys.contains(&"model.0.embedding.word_embeddings.weight".to_string()));
        assert!(keys.contains(&"model.1.decoder.layers.1.mlp.linear_fc2.weight".to_string()));
        assert!(!keys.iter().any(|k| k.starts_with("model.1.embedding")));
        assert!(!keys.iter().any(|k| k.starts_with("model.0.output_layer")));
        Ok(())
    }

    #[test]
    fn test_interleaved_uneven_split_rejected() {
        let result = GptSkeleton::new(dims(), 3)
            .wrapping(WrappingMode::Interleaved)
            .virtual_chunks(2)
            .build();
        assert!(matches!(result, Err(PeftError::Configuration(_))));
    }

    #[test]
    fn test_from_config() -> Result<()> {
        let cfg: Value = serde_yaml::from_str(
            "hidden_size: 16\nnum_attention_heads: 2\nnum_layers: 3\nmcore_gpt: false\nmegatron_amp_O2: true\n",
        )?;
        let model = GptSkeleton::from_config(&cfg)?.build()?;
        assert!(model
            .submodule("module.language_model.encoder.layers.2")
            .is_some());
        Ok(())
    }
}
