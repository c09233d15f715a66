//! P-Tuning prompt encoder.
//!
//! Learns `virtual_tokens` embeddings, reparameterized through a two-layer MLP,
//! and prepends them to the input embeddings. Only the first pipeline stage
//! holds input embeddings, so only that stage hosts this adapter.
//!
//! Reference: <https://arxiv.org/abs/2103.10385>

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Activation, Linear};
use serde::{Deserialize, Serialize};

use crate::adapters::AdapterKind;
use crate::error::{PeftError, Result};
use crate::param::{ParamStore, Parameter};
use crate::traits::{Adapter, Validate};

/// Configuration for the prompt encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEncoderConfig {
    /// Number of virtual tokens (soft prompt length).
    pub virtual_tokens: usize,
    /// Hidden width of the reparameterization MLP.
    pub bottleneck_dim: usize,
    /// Width of the raw virtual token embeddings.
    pub embedding_dim: usize,
    /// Width of the produced embeddings (the model hidden size).
    pub output_dim: usize,
    /// Std of the embedding initialization.
    #[serde(default = "default_init_std")]
    pub init_std: f64,
}

fn default_init_std() -> f64 {
    0.023
}

impl Validate for PromptEncoderConfig {
    fn validate(&self) -> Result<()> {
        if self.virtual_tokens == 0 {
            return Err(PeftError::InvalidConfig(
                "virtual_tokens must be > 0".into(),
            ));
        }
        if self.bottleneck_dim == 0 || self.embedding_dim == 0 || self.output_dim == 0 {
            return Err(PeftError::InvalidConfig(
                "prompt encoder dimensions must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Prompt encoder adapter.
pub struct PromptEncoderAdapter {
    params: ParamStore,
    config: PromptEncoderConfig,
    position: Option<usize>,
}

impl PromptEncoderAdapter {
    /// Create a new prompt encoder with random embeddings.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails or tensor creation fails.
    pub fn new(config: PromptEncoderConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        #[allow(clippy::cast_possible_truncation)]
        let std = config.init_std as f32;
        let mut params = ParamStore::new();
        params.insert(
            "embedding.weight".into(),
            Parameter::new(&Tensor::randn(
                0.0f32,
                std,
                (config.virtual_tokens, config.embedding_dim),
                device,
            )?)?,
        );
        params.insert(
            "first.weight".into(),
            Parameter::new(&Tensor::randn(
                0.0f32,
                0.02,
                (config.bottleneck_dim, config.embedding_dim),
                device,
            )?)?,
        );
        params.insert(
            "first.bias".into(),
            Parameter::new(&Tensor::zeros(config.bottleneck_dim, DType::F32, device)?)?,
        );
        params.insert(
            "second.weight".into(),
            Parameter::new(&Tensor::randn(
                0.0f32,
                0.02,
                (config.output_dim, config.bottleneck_dim),
                device,
            )?)?,
        );
        params.insert(
            "second.bias".into(),
            Parameter::new(&Tensor::zeros(config.output_dim, DType::F32, device)?)?,
        );

        Ok(Self {
            params,
            config,
            position: None,
        })
    }

    fn weight(&self, name: &str) -> Result<Tensor> {
        self.params
            .get(name)
            .map(|p| p.tensor().clone())
            .ok_or_else(|| PeftError::WeightLoad(format!("missing adapter parameter '{name}'")))
    }

    /// Virtual token embeddings: [`virtual_tokens`, `output_dim`].
    ///
    /// # Errors
    ///
    /// Returns an error if tensor operations fail.
    pub fn virtual_embeddings(&self) -> Result<Tensor> {
        let first = Linear::new(self.weight("first.weight")?, Some(self.weight("first.bias")?));
        let second = Linear::new(self.weight("second.weight")?, Some(self.weight("second.bias")?));
        let x = first.forward(&self.weight("embedding.weight")?)?;
        let x = Activation::Gelu.forward(&x)?;
        Ok(second.forward(&x)?)
    }
}

impl Adapter for PromptEncoderAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::PromptEncoder
    }

    /// Prepend virtual tokens to `[batch, seq_len, hidden]` input embeddings.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let batch_size = input.dim(0)?;
        let prompt = self.virtual_embeddings()?.unsqueeze(0)?.expand((
            batch_size,
            self.config.virtual_tokens,
            self.config.output_dim,
        ))?;
        Ok(Tensor::cat(&[&prompt, input], 1)?)
    }

    fn parameters(&self) -> &ParamStore {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn position(&self) -> Option<usize> {
        self.position
    }

    fn set_position(&mut self, position: usize) {
        self.position = Some(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PromptEncoderConfig {
        PromptEncoderConfig {
            virtual_tokens: 10,
            bottleneck_dim: 32,
            embedding_dim: 16,
            output_dim: 64,
            init_std: 0.023,
        }
    }

    #[test]
    fn test_prepend_to_input() -> Result<()> {
        let adapter = PromptEncoderAdapter::new(config(), &Device::Cpu)?;
        let input = Tensor::zeros((2, 20, 64), DType::F32, &Device::Cpu)?;
        let output = adapter.forward(&input)?;
        // [2, 10 + 20, 64]
        assert_eq!(output.dims(), &[2, 30, 64]);
        Ok(())
    }

    #[test]
    fn test_num_parameters() -> Result<()> {
        let adapter = PromptEncoderAdapter::new(config(), &Device::Cpu)?;
        assert_eq!(
            adapter.num_parameters(),
            10 * 16 + 32 * 16 + 32 + 64 * 32 + 64
        );
        Ok(())
    }

    #[test]
    fn test_zero_virtual_tokens_rejected() {
        let config = PromptEncoderConfig {
            virtual_tokens: 0,
            ..config()
        };
        assert!(PromptEncoderAdapter::new(config, &Device::Cpu).is_err());
    }
}
