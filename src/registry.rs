//! Per-module adapter storage.
//!
//! An [`AdapterHost`] is what makes a module adapter-capable: it declares the
//! accepted adapter kinds and owns the attached adapters under their names,
//! in attachment order. Adapters are never detached.

use candle_core::{Device, Tensor};

use crate::adapters::{self, AdapterConfig, AdapterKind};
use crate::error::{PeftError, Result};
use crate::traits::{Adapter, AdapterCapable};

/// Adapter slots of one module.
#[derive(Default)]
pub struct AdapterHost {
    /// Accepted adapter kinds
    accepted: Vec<AdapterKind>,
    /// Attached adapters, in attachment order
    adapters: Vec<(String, Box<dyn Adapter>)>,
}

impl AdapterHost {
    /// Create a host accepting the given kinds.
    #[must_use]
    pub fn new(accepted: &[AdapterKind]) -> Self {
        let mut host = Self::default();
        host.accept(accepted);
        host
    }

    /// Extend the accepted kinds, keeping existing adapters.
    pub fn accept(&mut self, kinds: &[AdapterKind]) {
        for kind in kinds {
            if !self.accepted.contains(kind) {
                self.accepted.push(*kind);
            }
        }
    }

    /// Whether `kind` is accepted.
    #[must_use]
    pub fn accepts(&self, kind: AdapterKind) -> bool {
        self.accepted.contains(&kind)
    }

    /// Attach an already-built adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter kind is not accepted or the name is taken.
    pub fn register_adapter(&mut self, name: impl Into<String>, adapter: Box<dyn Adapter>) -> Result<()> {
        let name = name.into();
        if !self.accepts(adapter.kind()) {
            return Err(PeftError::Configuration(format!(
                "adapter '{name}' of kind {:?} is not accepted by this module",
                adapter.kind()
            )));
        }
        if self.contains_adapter(&name) {
            return Err(PeftError::AdapterExists { name });
        }
        self.adapters.push((name, adapter));
        Ok(())
    }

    /// Check if an adapter with the given name exists.
    #[must_use]
    pub fn contains_adapter(&self, name: &str) -> bool {
        self.adapters.iter().any(|(n, _)| n == name)
    }

    /// Get the number of attached adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Check if no adapter is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Iterate `(name, adapter)` pairs in attachment order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Adapter)> {
        self.adapters.iter().map(|(n, a)| (n.as_str(), a.as_ref()))
    }

    /// Mutable iteration in attachment order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut (dyn Adapter + 'static))> {
        self.adapters.iter_mut().map(|(n, a)| (n.as_str(), a.as_mut()))
    }

    /// Apply every attached adapter to `input` and sum the results.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter is attached or a forward pass fails.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut outputs = self.adapters.iter().map(|(_, a)| a.forward(input));
        let first = outputs.next().ok_or_else(|| PeftError::AdapterNotFound {
            name: "no adapter attached".to_string(),
        })??;
        outputs.try_fold(first, |acc, out| -> Result<Tensor> { Ok(acc.broadcast_add(&out?)?) })
    }
}

impl AdapterCapable for AdapterHost {
    fn accepted_adapter_types(&self) -> &[AdapterKind] {
        &self.accepted
    }

    fn add_adapter(&mut self, name: &str, cfg: &AdapterConfig, device: &Device) -> Result<()> {
        if self.contains_adapter(name) {
            return Err(PeftError::AdapterExists {
                name: name.to_string(),
            });
        }
        let adapter = adapters::build(cfg, device)?;
        self.register_adapter(name, adapter)
    }

    fn adapter_module(&self, name: &str) -> Option<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a.as_ref())
    }

    fn adapter_module_mut(&mut self, name: &str) -> Option<&mut (dyn Adapter + 'static)> {
        self.adapters
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a.as_mut())
    }

    fn adapter_layer(&self) -> Vec<&str> {
        self.adapters.iter().map(|(n, _)| n.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{names, AdapterParams, InfusedConfig, ParallelLinearConfig};
    use candle_core::DType;

    fn lora_cfg() -> AdapterConfig {
        AdapterConfig::new(
            names::LORA_KQV,
            AdapterKind::LoraKqv,
            AdapterParams::ParallelLinear(ParallelLinearConfig::new(64, 192, 8)),
        )
    }

    #[test]
    fn test_host_creation() {
        let host = AdapterHost::new(&[AdapterKind::LoraKqv]);
        assert!(host.is_empty());
        assert_eq!(host.accepted_adapter_types(), &[AdapterKind::LoraKqv]);
    }

    #[test]
    fn test_add_adapter() -> Result<()> {
        let mut host = AdapterHost::new(&[AdapterKind::LoraKqv, AdapterKind::Infused]);
        host.add_adapter(names::LORA_KQV, &lora_cfg(), &Device::Cpu)?;
        host.add_adapter(
            names::KEY_INFUSED,
            &AdapterConfig::new(
                names::KEY_INFUSED,
                AdapterKind::Infused,
                AdapterParams::Infused(InfusedConfig { in_features: 64 }),
            ),
            &Device::Cpu,
        )?;
        assert_eq!(host.adapter_layer(), vec![names::LORA_KQV, names::KEY_INFUSED]);
        assert_eq!(
            host.adapter_module(names::LORA_KQV).map(|a| a.num_parameters()),
            Some(8 * (64 + 192))
        );
        Ok(())
    }

    #[test]
    fn test_add_duplicate_adapter() -> Result<()> {
        let mut host = AdapterHost::new(&[AdapterKind::LoraKqv]);
        host.add_adapter(names::LORA_KQV, &lora_cfg(), &Device::Cpu)?;
        let result = host.add_adapter(names::LORA_KQV, &lora_cfg(), &Device::Cpu);
        assert!(matches!(result, Err(PeftError::AdapterExists { .. })));
        assert_eq!(host.len(), 1);
        Ok(())
    }

    #[test]
    fn test_unaccepted_kind_rejected() {
        let mut host = AdapterHost::new(&[AdapterKind::ParallelLinear]);
        let result = host.add_adapter(names::LORA_KQV, &lora_cfg(), &Device::Cpu);
        assert!(matches!(result, Err(PeftError::Configuration(_))));
    }

    #[test]
    fn test_accept_extends_without_dropping_adapters() -> Result<()> {
        let mut host = AdapterHost::new(&[AdapterKind::LoraKqv]);
        host.add_adapter(names::LORA_KQV, &lora_cfg(), &Device::Cpu)?;
        host.accept(&[AdapterKind::LoraKqv, AdapterKind::Infused]);
        assert_eq!(host.accepted_adapter_types().len(), 2);
        assert_eq!(host.len(), 1);
        Ok(())
    }

    #[test]
    fn test_forward_sums_adapters() -> Result<()> {
        let mut host = AdapterHost::new(&[AdapterKind::LoraKqv]);
        host.add_adapter(names::LORA_KQV, &lora_cfg(), &Device::Cpu)?;
        let input = Tensor::zeros((1, 10, 64), DType::F32, &Device::Cpu)?;
        let output = host.forward(&input)?;
        assert_eq!(output.dims(), &[1, 10, 192]);
        Ok(())
    }
}
