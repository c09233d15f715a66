//! IA³ infused adapter: a learned per-channel rescaling vector.
//!
//! Reference: <https://arxiv.org/abs/2205.05638>

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::adapters::AdapterKind;
use crate::error::{PeftError, Result};
use crate::param::{ParamStore, Parameter};
use crate::traits::{Adapter, Validate};

/// Configuration for an infused adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfusedConfig {
    /// Width of the rescaled activation.
    pub in_features: usize,
}

impl Validate for InfusedConfig {
    fn validate(&self) -> Result<()> {
        if self.in_features == 0 {
            return Err(PeftError::InvalidConfig("in_features must be > 0".into()));
        }
        Ok(())
    }
}

/// Rescales the last dimension of its input by a learned vector initialized to ones.
pub struct InfusedAdapter {
    kind: AdapterKind,
    params: ParamStore,
    position: Option<usize>,
}

impl InfusedAdapter {
    /// Create a new infused adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or tensor creation fails.
    pub fn new(kind: AdapterKind, config: InfusedConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut params = ParamStore::new();
        params.insert(
            "scalers".into(),
            Parameter::new(&Tensor::ones(config.in_features, DType::F32, device)?)?,
        );
        Ok(Self {
            kind,
            params,
            position: None,
        })
    }
}

impl Adapter for InfusedAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let scalers = self
            .params
            .get("scalers")
            .ok_or_else(|| PeftError::WeightLoad("missing adapter parameter 'scalers'".into()))?;
        Ok(input.broadcast_mul(scalers.tensor())?)
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

    #[test]
    fn test_infused_starts_as_identity() -> Result<()> {
        let adapter = InfusedAdapter::new(AdapterKind::Infused, InfusedConfig { in_features: 8 }, &Device::Cpu)?;
        let input = Tensor::randn(0f32, 1f32, (2, 4, 8), &Device::Cpu)?;
        let output = adapter.forward(&input)?;
        let diff = (output - &input)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_invalid_width() {
        let config = InfusedConfig { in_features: 0 };
        assert!(config.validate().is_err());
    }
}
