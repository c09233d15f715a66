//! State-dict projection.
//!
//! Before setup completes (or without adapters) the state dict is the full
//! model under its wrapping prefix. Once adapters are active and setup is
//! complete it holds only adapter parameters, renamed to the canonical
//! (non-O2) key form. Loads always require an exact key match.

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;
use tracing::debug;

use crate::adapters::names;
use crate::error::{PeftError, Result};
use crate::keys::KeySet;
use crate::model::PeftModel;
use crate::naming::{canonical_state_key, strip_model_prefix, WrappingMode, MODEL_ROOT};
use crate::param::Parameter;
use crate::topology;

/// Parameter key to tensor.
pub type StateDict = HashMap<String, Tensor>;

/// Checkpoint handed to [`PeftModel::on_load_checkpoint`] by the trainer.
#[derive(Debug, Clone, Default)]
pub struct TrainerCheckpoint {
    /// Model state dict.
    pub state_dict: StateDict,
    /// Per-virtual-chunk state dicts, keyed by chunk index.
    pub virtual_chunks: BTreeMap<usize, StateDict>,
}

/// Distributed-checkpoint description of one parameter tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedTensor {
    /// Checkpoint key.
    pub key: String,
    /// Local shard shape.
    pub shape: Vec<usize>,
    /// Tensor-parallel rank holding the shard.
    pub tensor_rank: usize,
    /// Tensor-parallel group size.
    pub tensor_world_size: usize,
    /// Pipeline stage holding the shard.
    pub pipeline_rank: usize,
}

impl PeftModel {
    /// Every parameter under the model's wrapping prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor cannot be copied.
    pub fn full_state_dict(&self) -> Result<StateDict> {
        self.model()
            .named_parameters(MODEL_ROOT)
            .into_iter()
            .map(|(key, param)| Ok((key, param.snapshot()?)))
            .collect()
    }

    /// Adapter parameters only, under canonical keys.
    ///
    /// # Errors
    ///
    /// Returns an error if a recorded adapter key no longer resolves.
    pub fn peft_state_dict(&self) -> Result<StateDict> {
        let params = self.model().parameter_map(MODEL_ROOT);
        self.adapter_keys()
            .iter()
            .map(|key| {
                let param = params.get(key).ok_or_else(|| PeftError::KeyMismatch {
                    missing: vec![key.to_string()],
                    unexpected: Vec::new(),
                })?;
                Ok((canonical_state_key(key), param.snapshot()?))
            })
            .collect()
    }

    /// Adapter keys in canonical form.
    #[must_use]
    pub fn canonical_adapter_keys(&self) -> KeySet {
        self.adapter_keys().map_keys(canonical_state_key)
    }

    /// Serialize: adapter parameters once setup is complete, otherwise the
    /// full model.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor cannot be copied.
    pub fn state_dict(&self) -> Result<StateDict> {
        if self.state().adapters_only() {
            self.peft_state_dict()
        } else {
            self.full_state_dict()
        }
    }

    /// Deserialize. An empty state dict is ignored; the trainer restores it
    /// through [`Self::on_load_checkpoint`].
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::KeyMismatch`] unless the keys equal the canonical
    /// adapter keys (setup complete) or the full parameter set (otherwise).
    pub fn load_state_dict(&mut self, state_dict: &StateDict) -> Result<()> {
        if state_dict.is_empty() {
            debug!("empty state dict, deferring to on_load_checkpoint");
            return Ok(());
        }
        let incoming = KeySet::capture(state_dict.keys().cloned());
        if self.state().adapters_only() {
            self.canonical_adapter_keys().ensure_matches(&incoming)?;
            self.assign_canonical(state_dict)
        } else {
            self.snapshot_keys().ensure_matches(&incoming)?;
            let params = self.model().parameter_map(MODEL_ROOT);
            assign_all(&params, state_dict)
        }
    }

    /// Write tensors addressed by canonical keys, leaving other parameters
    /// untouched.
    pub(crate) fn assign_canonical(&self, state_dict: &StateDict) -> Result<()> {
        let params: HashMap<String, &Parameter> = self
            .model()
            .named_parameters(MODEL_ROOT)
            .into_iter()
            .map(|(key, param)| (canonical_state_key(&key), param))
            .collect();
        assign_all(&params, state_dict)
    }

    /// Shard descriptions for distributed checkpointing.
    ///
    /// `None` outside the native runtime, and once adapters are active and
    /// setup is complete (only the dense adapter state dict is saved then).
    #[must_use]
    pub fn sharded_state_dict(&self, prefix: &str) -> Option<Vec<ShardedTensor>> {
        if !self.options().mcore_gpt || self.state().adapters_only() {
            return None;
        }
        let parallel = self.parallel();
        Some(
            self.model()
                .named_parameters(MODEL_ROOT)
                .into_iter()
                .map(|(key, param)| ShardedTensor {
                    key: format!("{prefix}{}", canonical_state_key(&key)),
                    shape: param.tensor().dims().to_vec(),
                    tensor_rank: parallel.tensor_rank(),
                    tensor_world_size: parallel.tensor_world_size(),
                    pipeline_rank: parallel.pipeline_rank(),
                })
                .collect(),
        )
    }

    /// Trainer checkpoint hook.
    ///
    /// Acts only when adapters are active and setup is complete, and skips
    /// stages that do not host a recorded P-Tuning adapter's first stage.
    /// Under the native runtime each core module loads its state dict
    /// non-strictly (the per-chunk one when virtual pipelining is on) after
    /// stripping the leading `model.`; unexpected keys are an error. Under
    /// the legacy interleaved layout each chunk loads strictly with its
    /// virtual pipeline rank selected, and the rank is reset to 0 afterwards.
    /// Interleaved chunks are never mixed-precision wrapped, so chunk `i`
    /// loads directly into `model.<i>`.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::KeyMismatch`] on unexpected keys (or any mismatch
    /// in strict mode) and [`PeftError::WeightLoad`] if a chunk state dict is
    /// missing.
    pub fn on_load_checkpoint(&mut self, checkpoint: &TrainerCheckpoint) -> Result<()> {
        if !self.state().adapters_only() {
            debug!("adapters not finalized, full checkpoint restore is left to the trainer");
            return Ok(());
        }
        if topology::has_adapter(self.cfg(), names::PTUNING) && !self.first_stage_of_pipeline() {
            return Ok(());
        }

        if self.options().mcore_gpt {
            let virtual_pipeline = self.parallel().virtual_pipeline_world_size().is_some();
            for (index, core) in self.gpt_module_paths().iter().enumerate() {
                let state_dict = if virtual_pipeline {
                    chunk(checkpoint, index)?
                } else {
                    &checkpoint.state_dict
                };
                let stripped: StateDict = state_dict
                    .iter()
                    .map(|(key, tensor)| (strip_model_prefix(key).to_string(), tensor.clone()))
                    .collect();
                self.load_into(core, &stripped, false)?;
            }
        } else if self.wrapping_mode() == WrappingMode::Interleaved {
            let result = self
                .gpt_module_paths()
                .iter()
                .enumerate()
                .try_for_each(|(index, core)| {
                    self.parallel().set_virtual_pipeline_rank(index);
                    self.load_into(core, chunk(checkpoint, index)?, true)
                });
            self.parallel().set_virtual_pipeline_rank(0);
            result?;
        }
        Ok(())
    }

    /// Load a core-relative state dict into the core module at `core`.
    fn load_into(&self, core: &str, state_dict: &StateDict, strict: bool) -> Result<()> {
        let module = self.module_at(core).ok_or_else(|| PeftError::ModuleNotFound {
            path: core.to_string(),
        })?;
        let params = module.parameter_map("");
        let incoming = KeySet::capture(state_dict.keys().cloned());
        if strict {
            KeySet::capture(params.keys().cloned()).ensure_matches(&incoming)?;
        } else {
            let unexpected: Vec<String> = incoming
                .iter()
                .filter(|key| !params.contains_key(*key))
                .map(str::to_string)
                .collect();
            if !unexpected.is_empty() {
                return Err(PeftError::KeyMismatch {
                    missing: Vec::new(),
                    unexpected,
                });
            }
        }
        assign_all(&params, state_dict)
    }
}

fn chunk(checkpoint: &TrainerCheckpoint, index: usize) -> Result<&StateDict> {
    checkpoint
        .virtual_chunks
        .get(&index)
        .ok_or_else(|| PeftError::WeightLoad(format!("checkpoint has no state dict for model_{index}")))
}

fn assign_all(params: &HashMap<String, &Parameter>, state_dict: &StateDict) -> Result<()> {
    for (key, tensor) in state_dict {
        let param = params
            .get(key)
            .ok_or_else(|| PeftError::WeightLoad(format!("no parameter named '{key}'")))?;
        param.assign(tensor)?;
    }
    Ok(())
}
