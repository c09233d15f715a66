//! PEFT-managed model: adapter injection and lifecycle state.
//!
//! [`PeftModel`] owns the module tree registered under `model`, the persisted
//! configuration document and the PEFT state. Injection walks the tree (or only
//! the selected transformer layers), swaps adapter-capable wrappers into
//! native modules where the PEFT config names them, attaches adapters, records
//! the topology in the configuration and derives the adapter key set from
//! before/after key snapshots.

use std::collections::BTreeSet;
use std::sync::Arc;

use candle_core::Device;
use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::adapters::AdapterConfig;
use crate::config::{ModelOptions, PeftConfig};
use crate::error::{PeftError, Result};
use crate::keys::KeySet;
use crate::mixins::{swap_mixin, NativeTarget};
use crate::module::Module;
use crate::naming::{canonical_state_key, canonicalize, join_path, WrappingMode, MODEL_ROOT, WRAPPER_SEGMENT};
use crate::parallel::ParallelState;
use crate::skeleton::{GptSkeleton, LEGACY_LAYERS, NATIVE_LAYERS};
use crate::state::PeftState;
use crate::summary::ParameterSummary;
use crate::topology;
use crate::traits::{Adapter, AdapterCapable, Validate};

/// A base model plus the PEFT bookkeeping around it.
pub struct PeftModel {
    /// Module tree registered under `model`
    model: Module,
    /// Persisted model configuration, including the adapter topology record
    cfg: Value,
    /// Runtime options read from `cfg`
    options: ModelOptions,
    /// Wrapping layout of `model`
    mode: WrappingMode,
    /// Distributed runtime queries
    parallel: Arc<dyn ParallelState>,
    /// Lifecycle phase and key snapshots
    state: PeftState,
    /// Soft prompt length once a P-Tuning adapter is injected on this stage
    virtual_tokens: Option<usize>,
    /// Device new adapters are created on
    device: Device,
}

impl PeftModel {
    /// Wrap an existing module tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime options in `cfg` are malformed or
    /// inconsistent.
    pub fn new(model: Module, cfg: Value, parallel: Arc<dyn ParallelState>) -> Result<Self> {
        let options = ModelOptions::from_config(&cfg)?;
        let mode = options.wrapping_mode()?;
        Ok(Self {
            model,
            cfg,
            options,
            mode,
            parallel,
            state: PeftState::default(),
            virtual_tokens: None,
            device: Device::Cpu,
        })
    }

    /// Build a GPT skeleton from `cfg` on `device` and wrap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not describe a model.
    pub fn from_config(cfg: Value, parallel: Arc<dyn ParallelState>, device: &Device) -> Result<Self> {
        let model = GptSkeleton::from_config(&cfg)?.device(device).build()?;
        Ok(Self::new(model, cfg, parallel)?.with_device(device))
    }

    /// Create new adapters on `device`.
    #[must_use]
    pub fn with_device(mut self, device: &Device) -> Self {
        self.device = device.clone();
        self
    }

    /// The module tree registered under `model`.
    #[must_use]
    pub fn model(&self) -> &Module {
        &self.model
    }

    /// Mutable module tree.
    pub fn model_mut(&mut self) -> &mut Module {
        &mut self.model
    }

    /// Persisted configuration.
    #[must_use]
    pub fn cfg(&self) -> &Value {
        &self.cfg
    }

    /// Runtime options.
    #[must_use]
    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// Wrapping layout.
    #[must_use]
    pub fn wrapping_mode(&self) -> WrappingMode {
        self.mode
    }

    /// PEFT lifecycle state.
    #[must_use]
    pub fn state(&self) -> &PeftState {
        &self.state
    }

    /// Distributed runtime.
    #[must_use]
    pub fn parallel(&self) -> &dyn ParallelState {
        self.parallel.as_ref()
    }

    /// Device new adapters are created on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Soft prompt length, if a P-Tuning adapter lives on this stage.
    #[must_use]
    pub fn virtual_tokens(&self) -> Option<usize> {
        self.virtual_tokens
    }

    /// Keys added by the last injection.
    #[must_use]
    pub fn adapter_keys(&self) -> &KeySet {
        self.state.adapter_keys()
    }

    /// Keys of every parameter currently registered, adapters included.
    #[must_use]
    pub fn snapshot_keys(&self) -> KeySet {
        KeySet::capture(self.model.named_parameters(MODEL_ROOT).into_iter().map(|(k, _)| k))
    }

    /// Parameter counts of the whole model.
    #[must_use]
    pub fn summarize(&self) -> ParameterSummary {
        ParameterSummary::from_parameters(self.model.named_parameters(MODEL_ROOT).into_iter().map(|(_, p)| p))
    }

    /// Module at a full path (`model`, `model.decoder.layers.0`, ...).
    #[must_use]
    pub fn module_at(&self, path: &str) -> Option<&Module> {
        self.model.submodule(relative_to_root(path)?)
    }

    pub(crate) fn module_at_mut(&mut self, path: &str) -> Result<&mut Module> {
        let relative = relative_to_root(path).ok_or_else(|| PeftError::ModuleNotFound {
            path: path.to_string(),
        })?;
        self.model.require_submodule_mut(relative)
    }

    /// Adapter `name` attached to the module at `path`.
    #[must_use]
    pub fn adapter(&self, path: &str, name: &str) -> Option<&dyn Adapter> {
        self.module_at(path)?.host()?.adapter_module(name)
    }

    /// Whether this rank hosts the first pipeline stage.
    ///
    /// Reads the `pre_process` hint of the model, or of its single wrapped or
    /// first interleaved module. When neither carries the hint the answer is
    /// `false`.
    #[must_use]
    pub fn first_stage_of_pipeline(&self) -> bool {
        if let Some(pre_process) = self.model.pre_process() {
            return pre_process;
        }
        let nested = match self.mode {
            WrappingMode::DistributedOptimizer => self.model.child(WRAPPER_SEGMENT),
            WrappingMode::Interleaved => self.model.children().next().map(|(_, m)| m),
            WrappingMode::Unwrapped => None,
        };
        if let Some(pre_process) = nested.and_then(Module::pre_process) {
            return pre_process;
        }
        warn!("no pre_process hint found on the model, cannot detect pipeline stage; assuming not first stage");
        false
    }

    /// Full paths of the core model modules: one per virtual chunk when
    /// interleaved, otherwise a single path.
    #[must_use]
    pub fn gpt_module_paths(&self) -> Vec<String> {
        match self.mode {
            WrappingMode::Unwrapped => vec![MODEL_ROOT.to_string()],
            WrappingMode::DistributedOptimizer => vec![join_path(MODEL_ROOT, WRAPPER_SEGMENT)],
            WrappingMode::Interleaved => self
                .model
                .children()
                .map(|(name, _)| join_path(MODEL_ROOT, name))
                .collect(),
        }
    }

    /// Full paths of the transformer layers, in order across chunks.
    #[must_use]
    pub fn layer_paths(&self) -> Vec<String> {
        self.layer_paths_for(self.options.mcore_gpt)
    }

    pub(crate) fn layer_paths_for(&self, native: bool) -> Vec<String> {
        self.numbered_layers(native).into_iter().map(|(_, path)| path).collect()
    }

    /// Transformer layers held by this rank, each with its 0-based global
    /// layer number.
    ///
    /// Every chunk holds the same number of layers. Chunk `v` on pipeline
    /// stage `r` of `p` starts at global layer `(v * p + r) * layers_per_chunk`.
    #[must_use]
    pub fn numbered_layers(&self, native: bool) -> Vec<(usize, String)> {
        let list = if native { NATIVE_LAYERS } else { LEGACY_LAYERS };
        let stage = self.parallel.pipeline_rank();
        let stages = self.parallel.pipeline_world_size().max(1);
        let mut layers = Vec::new();
        for (chunk, core) in self.gpt_module_paths().into_iter().enumerate() {
            let container = join_path(&core, list);
            let Some(module) = self.module_at(&container) else {
                continue;
            };
            let names: Vec<&str> = module.children().map(|(name, _)| name).collect();
            let offset = (chunk * stages + stage) * names.len();
            layers.extend(
                names
                    .into_iter()
                    .enumerate()
                    .map(|(i, name)| (offset + i, join_path(&container, name))),
            );
        }
        layers
    }

    /// Inject the adapters of one or more PEFT configs and freeze the base.
    ///
    /// Adapter names must not already be attached to the target modules;
    /// injecting the same config twice fails with
    /// [`PeftError::AdapterExists`] and leaves the model in an indeterminate
    /// state.
    ///
    /// # Errors
    ///
    /// - [`PeftError::MissingDependency`] if the native runtime is requested
    ///   but unavailable
    /// - [`PeftError::Configuration`] if a config has no native target table
    ///   under the native runtime, or requests tying for a method without a
    ///   tying rule
    /// - [`PeftError::InvalidTransition`] once setup is complete
    pub fn inject(&mut self, peft_cfgs: &[PeftConfig]) -> Result<()> {
        self.state.ensure_can_inject()?;
        let use_native = self.options.mcore_gpt;
        if use_native && !self.parallel.native_runtime_available() {
            return Err(PeftError::MissingDependency(
                "mcore_gpt is set but the native pipeline runtime is not available".into(),
            ));
        }
        for peft_cfg in peft_cfgs {
            peft_cfg.validate()?;
        }

        let base_keys = self.snapshot_keys();
        self.model.freeze();
        info!("Before adding PEFT params: {}", self.summarize());

        for peft_cfg in peft_cfgs {
            if peft_cfg.first_stage_only() {
                if !self.first_stage_of_pipeline() {
                    debug!(method = ?peft_cfg.method, "not the first pipeline stage, skipping");
                    continue;
                }
                self.virtual_tokens = peft_cfg.virtual_tokens;
            }

            let targets = if use_native {
                Some(peft_cfg.native_targets.as_ref().ok_or_else(|| {
                    PeftError::Configuration(format!(
                        "{:?} is not supported on the native runtime yet",
                        peft_cfg.method
                    ))
                })?)
            } else {
                None
            };

            for adapter in &peft_cfg.adapters {
                let adapter_targets = targets
                    .and_then(|t| t.get(&adapter.name))
                    .map(Vec::as_slice);
                let bound = if adapter.kind.first_stage_only() || self.layer_paths().is_empty() {
                    if peft_cfg.layer_selection.is_some() {
                        warn!(
                            adapter = %adapter.name,
                            "layer selection is specified but not supported for this adapter or model"
                        );
                    }
                    // First-stage adapters belong to the first chunk only.
                    let root = if adapter.kind.first_stage_only() {
                        self.gpt_module_paths().into_iter().next().unwrap_or_else(|| MODEL_ROOT.to_string())
                    } else {
                        MODEL_ROOT.to_string()
                    };
                    self.attach_in_tree(&root, adapter, adapter_targets)?
                } else {
                    if let Some(selection) = &peft_cfg.layer_selection {
                        info!(adapter = %adapter.name, ?selection, "layer selection is enabled");
                    }
                    self.attach_in_layers(adapter, peft_cfg.layer_selection.as_ref(), adapter_targets)?
                };
                debug!(adapter = %adapter.name, modules = bound.len(), "attached adapter");
                topology::record_adapter(&mut self.cfg, adapter, &bound)?;
            }
        }

        info!("After adding PEFT params: {}", self.summarize());
        let adapter_keys = self.snapshot_keys().difference(&base_keys);

        for peft_cfg in peft_cfgs.iter().filter(|c| c.weight_tying) {
            self.tie_weights(peft_cfg, use_native)?;
        }
        self.state.record_injection(base_keys, adapter_keys)
    }

    /// Declare training/inference setup finished; from now on only adapter
    /// parameters are serialized.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::InvalidTransition`] if no adapters were injected.
    pub fn mark_setup_complete(&mut self) -> Result<()> {
        self.state.mark_setup_complete()
    }

    fn attach_in_layers(
        &mut self,
        adapter: &AdapterConfig,
        selection: Option<&BTreeSet<usize>>,
        targets: Option<&[NativeTarget]>,
    ) -> Result<Vec<String>> {
        let mode = self.mode;
        let device = self.device.clone();
        let mut bound = Vec::new();
        for (number, layer_path) in self.numbered_layers(self.options.mcore_gpt) {
            if selection.is_some_and(|s| !s.contains(&number)) {
                continue;
            }
            let layer = self.module_at_mut(&layer_path)?;
            layer.visit_mut("", &mut |path, module| {
                if attach(module, &canonicalize(path, mode), adapter, targets, &device)? {
                    bound.push(canonical_state_key(&join_path(&layer_path, path)));
                }
                Ok(())
            })?;
        }
        Ok(bound)
    }

    /// Walk the subtree at `root` (a full path) and attach wherever eligible.
    fn attach_in_tree(
        &mut self,
        root: &str,
        adapter: &AdapterConfig,
        targets: Option<&[NativeTarget]>,
    ) -> Result<Vec<String>> {
        let mode = self.mode;
        let device = self.device.clone();
        let mut bound = Vec::new();
        self.module_at_mut(root)?.visit_mut(root, &mut |path, module| {
            if attach(module, &canonicalize(path, mode), adapter, targets, &device)? {
                bound.push(canonical_state_key(path));
            }
            Ok(())
        })?;
        Ok(bound)
    }
}

/// Attach `adapter` to `module` if eligible; `name` is the module's path
/// relative to the visited layer or the core model.
fn attach(
    module: &mut Module,
    name: &str,
    adapter: &AdapterConfig,
    targets: Option<&[NativeTarget]>,
    device: &Device,
) -> Result<bool> {
    let mut attached = false;
    match targets {
        Some(targets) => {
            for target in targets.iter().filter(|t| t.target == name) {
                swap_mixin(module, target.mixin);
                attached |= add_if_accepted(module, adapter, device)?;
            }
        }
        None => attached = add_if_accepted(module, adapter, device)?,
    }
    Ok(attached)
}

fn add_if_accepted(module: &mut Module, adapter: &AdapterConfig, device: &Device) -> Result<bool> {
    let Some(host) = module.host_mut() else {
        return Ok(false);
    };
    if !host.accepted_adapter_types().contains(&adapter.kind) {
        return Ok(false);
    }
    host.add_adapter(&adapter.name, adapter, device)?;
    Ok(true)
}

/// Path relative to the `model` root, or `None` for paths outside it.
fn relative_to_root(path: &str) -> Option<&str> {
    if path == MODEL_ROOT {
        return Some("");
    }
    path.strip_prefix(MODEL_ROOT).and_then(|r| r.strip_prefix('.'))
}
