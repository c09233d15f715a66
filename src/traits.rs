//! Core traits: the adapter interface and the adapter-capable module interface.

use candle_core::{Device, Tensor};

use crate::adapters::{AdapterConfig, AdapterKind};
use crate::error::Result;
use crate::keys::KeySet;
use crate::param::ParamStore;

/// Validation of hyperparameter structs.
pub trait Validate {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Uniform interface over adapter implementations.
///
/// The bookkeeping layer only needs parameter access and the tying hooks; the
/// forward pass is provided so hosts can apply their adapters.
pub trait Adapter: Send + Sync {
    /// Implementation kind of this adapter.
    fn kind(&self) -> AdapterKind;

    /// Forward pass applying the adapter transformation.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Named parameters of this adapter.
    fn parameters(&self) -> &ParamStore;

    /// Mutable access to the named parameters.
    fn parameters_mut(&mut self) -> &mut ParamStore;

    /// Position index assigned by weight tying, if any.
    fn position(&self) -> Option<usize>;

    /// Assign the position index.
    fn set_position(&mut self, position: usize);

    /// Get the number of parameters.
    #[must_use]
    fn num_parameters(&self) -> usize {
        self.parameters().values().map(|p| p.elem_count()).sum()
    }

    /// Replace this adapter's parameters with those of `source`, sharing storage,
    /// and take `position` as the position index.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PeftError::KeyMismatch`] if the two adapters do not have
    /// the same parameter names.
    fn tie_weights(&mut self, position: usize, source: &ParamStore) -> Result<()> {
        let own = KeySet::capture(self.parameters().keys().cloned());
        own.ensure_matches(&KeySet::capture(source.keys().cloned()))?;
        let params = self.parameters_mut();
        for (name, param) in source {
            params.insert(name.clone(), param.clone());
        }
        self.set_position(position);
        Ok(())
    }
}

/// A module that can host adapters.
pub trait AdapterCapable {
    /// Adapter kinds this module accepts.
    fn accepted_adapter_types(&self) -> &[AdapterKind];

    /// Instantiate and attach an adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is not accepted, the name is taken, or the
    /// adapter cannot be built.
    fn add_adapter(&mut self, name: &str, cfg: &AdapterConfig, device: &Device) -> Result<()>;

    /// Look up an attached adapter.
    fn adapter_module(&self, name: &str) -> Option<&dyn Adapter>;

    /// Look up an attached adapter mutably.
    fn adapter_module_mut(&mut self, name: &str) -> Option<&mut (dyn Adapter + 'static)>;

    /// Names of attached adapters, in attachment order.
    fn adapter_layer(&self) -> Vec<&str>;
}
