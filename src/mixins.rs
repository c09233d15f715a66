//! Adapter-capable wrappers for pipeline-parallel-native modules.
//!
//! Native modules are not adapter-capable by construction. Before attaching,
//! the injector swaps in the wrapper named by the PEFT config's target table,
//! which installs an [`AdapterHost`](crate::registry::AdapterHost) declaring the
//! kinds that wrapper accepts. Swapping twice only widens the accepted set.

use serde::{Deserialize, Serialize};

use crate::adapters::AdapterKind;
use crate::module::Module;

/// Adapter-capable wrapper for one native module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixinKind {
    /// Self-attention block.
    SelfAttention,
    /// MLP block.
    Mlp,
    /// Whole transformer layer.
    TransformerLayer,
    /// Input embedding.
    Embedding,
}

impl MixinKind {
    /// Adapter kinds the wrapped module accepts.
    #[must_use]
    pub fn accepted_types(self) -> &'static [AdapterKind] {
        match self {
            Self::SelfAttention => &[
                AdapterKind::LoraKqv,
                AdapterKind::LoraDenseAttention,
                AdapterKind::Infused,
            ],
            Self::Mlp => &[
                AdapterKind::LoraHto4h,
                AdapterKind::Lora4htoH,
                AdapterKind::MlpInfused,
            ],
            Self::TransformerLayer => &[AdapterKind::ParallelLinear],
            Self::Embedding => &[AdapterKind::PromptEncoder],
        }
    }
}

/// One entry of a PEFT config's native target table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeTarget {
    /// Module path relative to the core model or the visited layer (`""` is the layer itself).
    pub target: String,
    /// Wrapper to swap in.
    pub mixin: MixinKind,
}

impl NativeTarget {
    /// Create a target entry.
    pub fn new(target: impl Into<String>, mixin: MixinKind) -> Self {
        Self {
            target: target.into(),
            mixin,
        }
    }
}

/// Make `module` adapter-capable with the behavior of `mixin`.
pub fn swap_mixin(module: &mut Module, mixin: MixinKind) {
    module.install_host(mixin.accepted_types());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::AdapterCapable;

    #[test]
    fn test_swap_installs_host() {
        let mut module = Module::new("SelfAttention");
        assert!(module.host().is_none());
        swap_mixin(&mut module, MixinKind::SelfAttention);
        let host = module.host().map(|h| h.accepted_adapter_types().to_vec());
        assert_eq!(host, Some(MixinKind::SelfAttention.accepted_types().to_vec()));
    }

    #[test]
    fn test_swap_twice_widens() {
        let mut module = Module::new("TransformerLayer");
        swap_mixin(&mut module, MixinKind::TransformerLayer);
        swap_mixin(&mut module, MixinKind::Mlp);
        let accepted = module.host().map_or(0, |h| h.accepted_adapter_types().len());
        assert_eq!(accepted, 4);
    }
}
