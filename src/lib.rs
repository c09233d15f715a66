//! # peft-shard
//!
//! PEFT adapter bookkeeping for sharded transformer models.
//!
//! This crate injects adapters into a transformer's module tree and keeps the
//! books around them:
//! - **Injection** of `LoRA`, P-Tuning, canonical (Houlsby) adapters and IA³,
//!   on the native or legacy layer layout, with layer selection
//! - **Key tracking**: base vs. adapter parameter keys, normalized across
//!   mixed-precision (O2) and interleaved pipeline wrappings
//! - **State dicts** that shrink to adapter parameters once setup completes
//! - **Weight tying** of adapters across layers
//! - **Checkpoints**: adapter-only `.ckpt` files, packaged `.nemo` archives,
//!   and override-config merging
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peft_shard::{GptSkeleton, LocalParallelState, LoraTuning, ModelDims, PeftConfig, PeftModel};
//!
//! let dims = ModelDims::new(64, 4);
//! let model = GptSkeleton::new(dims.clone(), 2).build()?;
//! let mut peft = PeftModel::new(model, cfg, Arc::new(LocalParallelState::single()))?;
//!
//! peft.inject(&[PeftConfig::lora(&dims, &LoraTuning::default())?])?;
//! peft.mark_setup_complete()?;
//! peft.save_adapters("adapters.ckpt")?;
//! ```
//!
//! ## Architecture
//!
//! Models are [`Module`] trees of [`Parameter`]s rooted at `model`. Modules
//! that can carry adapters hold an [`AdapterHost`]; every adapter implements
//! the [`Adapter`] trait. [`PeftModel`] drives the injection state machine and
//! exposes the state-dict and checkpoint operations.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod keys;
pub mod merge;
pub mod mixins;
pub mod model;
pub mod module;
pub mod naming;
pub mod parallel;
pub mod param;
pub mod registry;
pub mod skeleton;
pub mod state;
pub mod state_dict;
pub mod summary;
pub mod topology;
pub mod traits;
mod tying;

#[cfg(test)]
mod testing;

pub use adapters::{
    names, AdapterConfig, AdapterKind, AdapterParams, InfusedAdapter, InfusedConfig,
    ParallelLinearAdapter, ParallelLinearConfig, PromptEncoderAdapter, PromptEncoderConfig,
};
pub use checkpoint::{
    extract_config, extract_config_and_state_dict, load_adapter_file, pack_archive,
    WorkingDirGuard, MODEL_CONFIG_YAML, MODEL_WEIGHTS_CKPT,
};
pub use config::{
    AdapterTuning, Ia3Tuning, LoraTuning, ModelDims, ModelOptions, PTuning, PeftConfig, PeftMethod,
    PeftSection,
};
pub use error::{PeftError, Result};
pub use keys::{KeySet, ParameterKey};
pub use merge::{merge_inference_config, merge_training_config, resolve_interpolations};
pub use mixins::{MixinKind, NativeTarget};
pub use model::PeftModel;
pub use module::Module;
pub use naming::{canonical_state_key, canonicalize, WrappingMode};
pub use parallel::{LocalParallelState, ParallelState};
pub use param::{ParamStore, Parameter};
pub use registry::AdapterHost;
pub use skeleton::GptSkeleton;
pub use state::{PeftPhase, PeftState};
pub use state_dict::{ShardedTensor, StateDict, TrainerCheckpoint};
pub use summary::{format_parameter_count, ParameterSummary};
pub use traits::{Adapter, AdapterCapable, Validate};
