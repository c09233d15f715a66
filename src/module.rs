//! Module tree of the base model.
//!
//! This is the capability surface the PEFT layer consumes from the transformer:
//! named parameters, named submodules, an optional adapter host per module and
//! the optional `pre_process` pipeline-stage hint. Adapter parameters appear
//! under `<module>.adapter_layer.<adapter name>.<param>`.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::adapters::AdapterKind;
use crate::error::{PeftError, Result};
use crate::naming::join_path;
use crate::param::{ParamStore, Parameter};
use crate::registry::AdapterHost;

/// Path segment under which a module's adapters are registered.
pub const ADAPTER_LAYER: &str = "adapter_layer";

/// A node of the model's module tree.
pub struct Module {
    kind: String,
    params: ParamStore,
    children: Vec<(String, Module)>,
    host: Option<AdapterHost>,
    pre_process: Option<bool>,
}

impl Module {
    /// Create an empty module of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: ParamStore::new(),
            children: Vec::new(),
            host: None,
            pre_process: None,
        }
    }

    /// Add a parameter initialized from `tensor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter cannot be created.
    pub fn with_param(mut self, name: impl Into<String>, tensor: &Tensor) -> Result<Self> {
        self.params.insert(name.into(), Parameter::new(tensor)?);
        Ok(self)
    }

    /// Append a child module.
    #[must_use]
    pub fn with_child(mut self, name: impl Into<String>, child: Module) -> Self {
        self.children.push((name.into(), child));
        self
    }

    /// Make the module adapter-capable from construction.
    #[must_use]
    pub fn with_adapter_support(mut self, accepted: &[AdapterKind]) -> Self {
        self.install_host(accepted);
        self
    }

    /// Set the pipeline-stage hint.
    #[must_use]
    pub fn with_pre_process(mut self, pre_process: bool) -> Self {
        self.pre_process = Some(pre_process);
        self
    }

    /// Module type identifier.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Pipeline-stage hint, if this module carries one.
    #[must_use]
    pub fn pre_process(&self) -> Option<bool> {
        self.pre_process
    }

    /// Own parameters (not including children or adapters).
    #[must_use]
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Adapter host, if the module is adapter-capable.
    #[must_use]
    pub fn host(&self) -> Option<&AdapterHost> {
        self.host.as_ref()
    }

    /// Mutable adapter host.
    pub fn host_mut(&mut self) -> Option<&mut AdapterHost> {
        self.host.as_mut()
    }

    /// Install an adapter host or widen the existing one.
    pub fn install_host(&mut self, accepted: &[AdapterKind]) {
        self.host
            .get_or_insert_with(AdapterHost::default)
            .accept(accepted);
    }

    /// Direct children in registration order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Direct children, mutably.
    pub fn children_mut(&mut self) -> impl Iterator<Item = (&str, &mut Module)> {
        self.children.iter_mut().map(|(n, c)| (n.as_str(), c))
    }

    /// Direct child by name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Submodule at a dotted path relative to this module (`""` is `self`).
    #[must_use]
    pub fn submodule(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |m, seg| m.child(seg))
    }

    /// Mutable submodule at a dotted path.
    pub fn submodule_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |m, seg| {
            m.children
                .iter_mut()
                .find(|(n, _)| n == seg)
                .map(|(_, c)| c)
        })
    }

    /// Mutable submodule, or [`PeftError::ModuleNotFound`].
    ///
    /// # Errors
    ///
    /// Returns an error if no module exists at `path`.
    pub fn require_submodule_mut(&mut self, path: &str) -> Result<&mut Module> {
        self.submodule_mut(path).ok_or_else(|| PeftError::ModuleNotFound {
            path: path.to_string(),
        })
    }

    /// All modules in pre-order, `self` first under `prefix`.
    #[must_use]
    pub fn named_modules(&self, prefix: &str) -> Vec<(String, &Module)> {
        let mut out = vec![(prefix.to_string(), self)];
        for (name, child) in &self.children {
            out.extend(child.named_modules(&join_path(prefix, name)));
        }
        out
    }

    /// Visit every module in pre-order with its full path.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error raised by `f`.
    pub fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, &mut Module) -> Result<()>,
    ) -> Result<()> {
        f(prefix, self)?;
        for (name, child) in &mut self.children {
            child.visit_mut(&join_path(prefix, name), f)?;
        }
        Ok(())
    }

    /// All parameters, including adapter parameters, keyed by full path.
    #[must_use]
    pub fn named_parameters(&self, prefix: &str) -> Vec<(String, &Parameter)> {
        let mut out: Vec<(String, &Parameter)> = self
            .params
            .iter()
            .map(|(name, p)| (join_path(prefix, name), p))
            .collect();
        if let Some(host) = &self.host {
            let layer = join_path(prefix, ADAPTER_LAYER);
            for (adapter_name, adapter) in host.iter() {
                let adapter_prefix = join_path(&layer, adapter_name);
                out.extend(
                    adapter
                        .parameters()
                        .iter()
                        .map(|(name, p)| (join_path(&adapter_prefix, name), p)),
                );
            }
        }
        for (name, child) in &self.children {
            out.extend(child.named_parameters(&join_path(prefix, name)));
        }
        out
    }

    /// [`Self::named_parameters`] as a lookup table.
    #[must_use]
    pub fn parameter_map(&self, prefix: &str) -> HashMap<String, &Parameter> {
        self.named_parameters(prefix).into_iter().collect()
    }

    /// Apply `f` to every parameter, including adapter parameters.
    pub fn for_each_parameter_mut(&mut self, f: &mut dyn FnMut(&mut Parameter)) {
        self.params.values_mut().for_each(&mut *f);
        if let Some(host) = &mut self.host {
            for (_, adapter) in host.iter_mut() {
                adapter.parameters_mut().values_mut().for_each(&mut *f);
            }
        }
        for (_, child) in &mut self.children {
            child.for_each_parameter_mut(f);
        }
    }

    /// Mark every currently registered parameter as frozen.
    pub fn freeze(&mut self) {
        self.for_each_parameter_mut(&mut |p| p.set_trainable(false));
    }
}
