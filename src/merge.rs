//! Merging override configurations into a checkpoint's stored configuration.

use std::path::Path;

use serde_yaml::Value;
use tracing::debug;

use crate::checkpoint::extract_config;
use crate::config::{get_path, mapping_at, set_path};
use crate::error::{PeftError, Result};

const ACTIVATION_CHECKPOINT_KEYS: [&str; 3] = [
    "activations_checkpoint_granularity",
    "activations_checkpoint_method",
    "activations_checkpoint_layers_per_pipeline",
];

/// Resolve `${a.b.c}` references against the root of `cfg`, in place.
///
/// A string that is exactly one reference takes the referenced value,
/// keeping its type. References embedded in longer strings are spliced in as
/// text and must point at scalars.
///
/// # Errors
///
/// Returns [`PeftError::Configuration`] for unresolved or cyclic references,
/// unterminated `${`, or a non-scalar spliced into text.
pub fn resolve_interpolations(cfg: &mut Value) -> Result<()> {
    let root = cfg.clone();
    Resolver {
        root: &root,
        stack: Vec::new(),
    }
    .resolve_tree(cfg)
}

struct Resolver<'a> {
    root: &'a Value,
    stack: Vec<String>,
}

impl Resolver<'_> {
    fn resolve_tree(&mut self, node: &mut Value) -> Result<()> {
        if let Some(text) = node.as_str().filter(|s| s.contains("${")).map(str::to_string) {
            *node = self.resolve_str(&text)?;
            return Ok(());
        }
        match node {
            Value::Mapping(map) => {
                for (_, value) in map.iter_mut() {
                    self.resolve_tree(value)?;
                }
            }
            Value::Sequence(seq) => {
                for value in seq {
                    self.resolve_tree(value)?;
                }
            }
            Value::Tagged(tagged) => self.resolve_tree(&mut tagged.value)?,
            _ => {}
        }
        Ok(())
    }

    fn resolve_str(&mut self, text: &str) -> Result<Value> {
        if let Some(path) = whole_reference(text) {
            return self.lookup(path);
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                PeftError::Configuration(format!("unterminated interpolation in '{text}'"))
            })?;
            let path = &after[..end];
            let value = self.lookup(path)?;
            out.push_str(&scalar_text(&value).ok_or_else(|| {
                PeftError::Configuration(format!("'${{{path}}}' is not a scalar and cannot be spliced into '{text}'"))
            })?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn lookup(&mut self, path: &str) -> Result<Value> {
        if self.stack.iter().any(|p| p == path) {
            return Err(PeftError::Configuration(format!(
                "cyclic interpolation: {} -> {path}",
                self.stack.join(" -> ")
            )));
        }
        let mut value = get_path(self.root, path)
            .cloned()
            .ok_or_else(|| PeftError::Configuration(format!("unresolved interpolation '${{{path}}}'")))?;
        self.stack.push(path.to_string());
        let resolved = self.resolve_tree(&mut value);
        self.stack.pop();
        resolved.map(|()| value)
    }
}

fn whole_reference(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains(['{', '}'])).then_some(inner)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("null".to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Sequence(seq)) => !seq.is_empty(),
        Some(Value::Mapping(map)) => !map.is_empty(),
        Some(Value::Tagged(tagged)) => truthy(Some(&tagged.value)),
    }
}

fn required<'a>(cfg: &'a Value, path: &str) -> Result<&'a Value> {
    get_path(cfg, path).ok_or_else(|| PeftError::Configuration(format!("missing '{path}'")))
}

/// Stored configuration of the archive at `path`, overlaid with a training
/// override `cfg`.
///
/// References in `cfg` are resolved first. Every key under `cfg.model`
/// replaces the stored key; `model.data.train_ds` batch sizes are lifted to
/// the top level; a set `trainer.precision` replaces the stored precision.
///
/// # Errors
///
/// Returns an error if the archive cannot be read, a reference cannot be
/// resolved, or `train_ds` lacks a batch size.
pub fn merge_training_config(path: impl AsRef<Path>, cfg: &Value) -> Result<Value> {
    let mut output = extract_config(path.as_ref())?;
    let mut cfg = cfg.clone();
    resolve_interpolations(&mut cfg)?;

    if let Some(model) = get_path(&cfg, "model").and_then(Value::as_mapping) {
        let target = mapping_at(&mut output, "")?;
        for (key, value) in model {
            target.insert(key.clone(), value.clone());
        }
    }
    if get_path(&cfg, "model.data.train_ds").is_some() {
        for key in ["micro_batch_size", "global_batch_size"] {
            let value = required(&cfg, &format!("model.data.train_ds.{key}"))?;
            set_path(&mut output, key, value.clone())?;
        }
    }
    if let Some(precision) = get_path(&cfg, "trainer.precision").filter(|v| truthy(Some(v))) {
        set_path(&mut output, "precision", precision.clone())?;
    }
    debug!(path = %path.as_ref().display(), "merged training config");
    Ok(output)
}

/// Stored configuration of the archive at `path`, prepared for inference
/// from the override `cfg`.
///
/// Precision and the test dataset come from `cfg`; activation checkpointing
/// is cleared; flash attention follows `cfg` only where the stored config
/// enables it; a set `seq_len_interpolation_factor` is copied. The stored
/// test dataset's `add_bos` and `tokens_to_generate` are written back into
/// `cfg.inference`.
///
/// # Errors
///
/// Returns [`PeftError::Configuration`] if a required key is missing, or an
/// error if the archive cannot be read.
pub fn merge_inference_config(path: impl AsRef<Path>, cfg: &mut Value) -> Result<Value> {
    let mut output = extract_config(path.as_ref())?;

    set_path(&mut output, "precision", required(cfg, "trainer.precision")?.clone())?;
    set_path(&mut output, "data.test_ds", required(cfg, "model.data.test_ds")?.clone())?;
    for key in ACTIVATION_CHECKPOINT_KEYS {
        set_path(&mut output, key, Value::Null)?;
    }
    if truthy(get_path(&output, "use_flash_attention")) {
        if let Some(flash) = get_path(cfg, "model.use_flash_attention").cloned() {
            set_path(&mut output, "use_flash_attention", flash)?;
        }
    }
    if let Some(factor) = get_path(cfg, "model.seq_len_interpolation_factor").filter(|v| !v.is_null()) {
        set_path(&mut output, "seq_len_interpolation_factor", factor.clone())?;
    }

    let add_bos = required(&output, "data.test_ds.add_bos")?.clone();
    let tokens = required(&output, "data.test_ds.tokens_to_generate")?.clone();
    set_path(cfg, "inference.add_BOS", add_bos)?;
    set_path(cfg, "inference.tokens_to_generate", tokens)?;
    debug!(path = %path.as_ref().display(), "merged inference config");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::checkpoint::pack_archive;
    use crate::state_dict::StateDict;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).expect("test yaml")
    }

    fn archive(dir: &TempDir, stored: &str) -> anyhow::Result<std::path::PathBuf> {
        let path = dir.path().join("sft.nemo");
        pack_archive(&path, &yaml(stored), &StateDict::new())?;
        Ok(path)
    }

    #[test]
    fn test_whole_reference_keeps_type() -> anyhow::Result<()> {
        let mut cfg = yaml("a: {b: 4}\nc: ${a.b}\nd: ${a}\n");
        resolve_interpolations(&mut cfg)?;
        assert_eq!(cfg["c"], Value::from(4));
        assert_eq!(cfg["d"], yaml("b: 4"));
        Ok(())
    }

    #[test]
    fn test_embedded_reference_spliced() -> anyhow::Result<()> {
        let mut cfg = yaml("name: gpt\nsize: 2\nrun: ${name}-${size}b\nalias: ${run}\n");
        resolve_interpolations(&mut cfg)?;
        assert_eq!(cfg["run"], Value::from("gpt-2b"));
        assert_eq!(cfg["alias"], Value::from("gpt-2b"));
        Ok(())
    }

    #[test]
    fn test_reference_errors() {
        for text in [
            "a: ${b}\nb: ${a}\n",
            "a: ${missing.key}\n",
            "a: x${b\nb: 1\n",
            "a: x${b}\nb: [1, 2]\n",
        ] {
            let mut cfg = yaml(text);
            assert!(
                matches!(resolve_interpolations(&mut cfg), Err(PeftError::Configuration(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_training_precision_override() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = archive(&dir, "precision: 16\nhidden_size: 8\n")?;
        let merged = merge_training_config(&path, &yaml("trainer: {precision: 32}\nmodel: {}\n"))?;
        assert_eq!(merged["precision"], Value::from(32));
        assert_eq!(merged["hidden_size"], Value::from(8));
        Ok(())
    }

    #[test]
    fn test_training_overlay_and_batch_sizes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = archive(&dir, "precision: bf16\nmicro_batch_size: 1\nhidden_size: 8\n")?;
        let cfg = yaml(
            "batch: 4\n\
             trainer: {precision: null}\n\
             model:\n  hidden_size: 8\n  lr: 0.1\n  data:\n    train_ds:\n      micro_batch_size: ${batch}\n      global_batch_size: 64\n",
        );
        let merged = merge_training_config(&path, &cfg)?;
        assert_eq!(merged["precision"], Value::from("bf16"));
        assert_eq!(merged["lr"], Value::from(0.1));
        assert_eq!(merged["micro_batch_size"], Value::from(4));
        assert_eq!(merged["global_batch_size"], Value::from(64));
        Ok(())
    }

    #[test]
    fn test_inference_merge() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = archive(
            &dir,
            "precision: 16\n\
             use_flash_attention: true\n\
             activations_checkpoint_method: uniform\n\
             data: {train_ds: {}}\n",
        )?;
        let mut cfg = yaml(
            "trainer: {precision: bf16}\n\
             model:\n  use_flash_attention: false\n  seq_len_interpolation_factor: 2\n  data:\n    test_ds: {add_bos: true, tokens_to_generate: 30}\n",
        );
        let merged = merge_inference_config(&path, &mut cfg)?;
        assert_eq!(merged["precision"], Value::from("bf16"));
        assert_eq!(merged["use_flash_attention"], Value::from(false));
        assert_eq!(merged["seq_len_interpolation_factor"], Value::from(2));
        for key in ACTIVATION_CHECKPOINT_KEYS {
            assert!(merged[key].is_null());
        }
        assert_eq!(cfg["inference"]["add_BOS"], Value::from(true));
        assert_eq!(cfg["inference"]["tokens_to_generate"], Value::from(30));
        Ok(())
    }

    #[test]
    fn test_inference_flash_attention_stays_off() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = archive(&dir, "precision: 16\n")?;
        let mut cfg = yaml(
            "trainer: {precision: 16}\n\
             model:\n  use_flash_attention: true\n  data:\n    test_ds: {add_bos: false, tokens_to_generate: 8}\n",
        );
        let merged = merge_inference_config(&path, &mut cfg)?;
        assert!(merged.get("use_flash_attention").is_none());
        assert!(merged.get("seq_len_interpolation_factor").is_none());
        Ok(())
    }

    #[test]
    fn test_inference_requires_test_ds() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = archive(&dir, "precision: 16\n")?;
        let mut cfg = yaml("trainer: {precision: 16}\nmodel: {}\n");
        assert!(matches!(
            merge_inference_config(&path, &mut cfg),
            Err(PeftError::Configuration(_))
        ));
        Ok(())
    }
}
