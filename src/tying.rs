//! Weight tying across repeated transformer layers.
//!
//! The first layer carrying adapters owns their parameters. Every later
//! layer's adapter of the same name is rebound to those parameters, so all
//! layers share one storage per adapter name. Position indices run
//! `0, 1, 2, ...` in layer-major, attachment-minor order.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{PeftConfig, PeftMethod};
use crate::error::{PeftError, Result};
use crate::model::PeftModel;
use crate::naming::join_path;
use crate::param::ParamStore;
use crate::traits::AdapterCapable;

impl PeftModel {
    /// Tie the adapters of `peft_cfg` across layers.
    ///
    /// LoRA ties the adapters hosted on each layer's `self_attention`;
    /// canonical adapters tie the adapters hosted on the layer itself.
    /// `native` selects the native or legacy layer list.
    ///
    /// # Errors
    ///
    /// - [`PeftError::Configuration`] for a method without a tying rule
    /// - [`PeftError::AdapterNotFound`] if a later layer has an adapter the
    ///   first layer does not
    pub fn tie_weights(&mut self, peft_cfg: &PeftConfig, native: bool) -> Result<()> {
        let target = match peft_cfg.method {
            PeftMethod::Lora => "self_attention",
            PeftMethod::CanonicalAdapters => "",
            other => {
                return Err(PeftError::Configuration(format!(
                    "{other:?} is not supported for tied weights"
                )))
            }
        };

        let mut sources: Option<HashMap<String, ParamStore>> = None;
        let mut position = 0;
        for layer_path in self.layer_paths_for(native) {
            let path = join_path(&layer_path, target);
            let Some(host) = self.module_at_mut(&path)?.host_mut() else {
                continue;
            };
            if host.is_empty() {
                continue;
            }
            let names: Vec<String> = host.adapter_layer().into_iter().map(str::to_string).collect();
            match &sources {
                None => {
                    let mut first = HashMap::new();
                    for name in names {
                        let adapter = host
                            .adapter_module_mut(&name)
                            .ok_or_else(|| PeftError::AdapterNotFound { name: name.clone() })?;
                        adapter.set_position(position);
                        debug!(adapter = %name, position, %path, "tying source");
                        first.insert(name, adapter.parameters().clone());
                        position += 1;
                    }
                    sources = Some(first);
                }
                Some(first) => {
                    for name in names {
                        let source = first
                            .get(&name)
                            .ok_or_else(|| PeftError::AdapterNotFound { name: name.clone() })?;
                        let adapter = host
                            .adapter_module_mut(&name)
                            .ok_or_else(|| PeftError::AdapterNotFound { name: name.clone() })?;
                        adapter.tie_weights(position, source)?;
                        debug!(adapter = %name, position, %path, "tied adapter");
                        position += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
