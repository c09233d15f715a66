//! Adapter topology record kept in the model configuration.
//!
//! Layout under the `adapters` section:
//!
//! ```yaml
//! adapters:
//!   global_cfg:
//!     adapter_meta_cfg:
//!       modules: { <adapter>: <module name> }
//!       paths: { <adapter>: [<bound module path>, ...] }
//!   <adapter>: <adapter config>
//! ```
//!
//! Entries are only ever added or overwritten.

use serde_yaml::{Mapping, Value};

use crate::adapters::AdapterConfig;
use crate::config::mapping_at;
use crate::error::{PeftError, Result};

/// Top-level configuration section holding the topology.
pub const ADAPTERS_KEY: &str = "adapters";
/// Global section key.
pub const GLOBAL_CFG_KEY: &str = "global_cfg";
/// Metadata section key.
pub const META_CFG_KEY: &str = "adapter_meta_cfg";

const MODULES_KEY: &str = "modules";
const PATHS_KEY: &str = "paths";

/// One adapter read back from a topology record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAdapter {
    /// Adapter name.
    pub name: String,
    /// Module name the adapter was registered under (`""` for the model itself).
    pub module: String,
    /// Module paths the adapter is bound to.
    pub paths: Vec<String>,
    /// Adapter hyperparameters.
    pub config: AdapterConfig,
}

/// Ensure `adapters.global_cfg.adapter_meta_cfg.{modules,paths}` exist.
///
/// # Errors
///
/// Returns an error if an existing node on the way is not a mapping.
pub fn prepare_default_adapter_config(cfg: &mut Value) -> Result<()> {
    let meta = meta_path();
    mapping_at(cfg, &format!("{meta}.{MODULES_KEY}"))?;
    mapping_at(cfg, &format!("{meta}.{PATHS_KEY}"))?;
    Ok(())
}

/// Split `module:adapter` into its parts; a plain name belongs to module `""`.
#[must_use]
pub fn resolve_adapter_module_name(name: &str) -> (String, String) {
    match name.split_once(':') {
        Some((module, adapter)) => (module.to_string(), adapter.to_string()),
        None => (String::new(), name.to_string()),
    }
}

/// Record an adapter, its owning module name and the module paths it is bound to.
///
/// Paths already recorded for the adapter are kept.
///
/// # Errors
///
/// Returns an error if the record is malformed or the adapter config cannot be
/// serialized.
pub fn record_adapter(cfg: &mut Value, adapter: &AdapterConfig, bound_paths: &[String]) -> Result<()> {
    prepare_default_adapter_config(cfg)?;
    let (module_name, adapter_name) = resolve_adapter_module_name(&adapter.name);
    let meta = meta_path();

    mapping_at(cfg, &format!("{meta}.{MODULES_KEY}"))?
        .insert(Value::from(adapter_name.as_str()), Value::from(module_name));

    let paths = mapping_at(cfg, &format!("{meta}.{PATHS_KEY}"))?
        .entry(Value::from(adapter_name.as_str()))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    let paths = paths.as_sequence_mut().ok_or_else(|| {
        PeftError::Configuration(format!("paths of adapter '{adapter_name}' is not a list"))
    })?;
    for path in bound_paths {
        let path = Value::from(path.as_str());
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    mapping_at(cfg, ADAPTERS_KEY)?.insert(Value::from(adapter_name), serde_yaml::to_value(adapter)?);
    Ok(())
}

/// Whether an adapter of the given name is recorded.
#[must_use]
pub fn has_adapter(cfg: &Value, name: &str) -> bool {
    cfg.get(ADAPTERS_KEY)
        .and_then(Value::as_mapping)
        .is_some_and(|m| m.contains_key(name))
}

/// Read every recorded adapter back, in recording order.
///
/// # Errors
///
/// Returns an error if an adapter entry does not deserialize.
pub fn recorded_adapters(cfg: &Value) -> Result<Vec<RecordedAdapter>> {
    let Some(section) = cfg.get(ADAPTERS_KEY).and_then(Value::as_mapping) else {
        return Ok(Vec::new());
    };
    let meta = section
        .get(GLOBAL_CFG_KEY)
        .and_then(|g| g.get(META_CFG_KEY))
        .cloned()
        .unwrap_or(Value::Mapping(Mapping::new()));

    let mut out = Vec::new();
    for (key, value) in section {
        let Some(name) = key.as_str() else { continue };
        if name == GLOBAL_CFG_KEY {
            continue;
        }
        let module = meta
            .get(MODULES_KEY)
            .and_then(|m| m.get(name))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let paths = meta
            .get(PATHS_KEY)
            .and_then(|p| p.get(name))
            .and_then(Value::as_sequence)
            .map(|seq| seq.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        out.push(RecordedAdapter {
            name: name.to_string(),
            module,
            paths,
            config: serde_yaml::from_value(value.clone())?,
        });
    }
    Ok(out)
}

fn meta_path() -> String {
    format!("{ADAPTERS_KEY}.{GLOBAL_CFG_KEY}.{META_CFG_KEY}")
}
