//! Checkpoint files.
//!
//! - Packaged archives (`.nemo`): a zip holding [`MODEL_CONFIG_YAML`] and
//!   [`MODEL_WEIGHTS_CKPT`] (flat safetensors).
//! - Adapter-only files (`.ckpt`): safetensors whose tensor names sit under the
//!   single top-level key [`ADAPTER_STATE_KEY`], i.e. `state_dict.<key>`.

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde_yaml::Value;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::PeftConfig;
use crate::error::{PeftError, Result};
use crate::keys::KeySet;
use crate::model::PeftModel;
use crate::state_dict::StateDict;

/// Configuration document inside a packaged archive.
pub const MODEL_CONFIG_YAML: &str = "model_config.yaml";
/// Weights blob inside a packaged archive.
pub const MODEL_WEIGHTS_CKPT: &str = "model_weights.ckpt";
/// Top-level key of an adapter-only weights file.
pub const ADAPTER_STATE_KEY: &str = "state_dict";

/// Changes the working directory and restores the previous one on drop.
#[derive(Debug)]
pub struct WorkingDirGuard {
    previous: PathBuf,
}

impl WorkingDirGuard {
    /// Enter `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be read or changed.
    pub fn enter(dir: &Path) -> Result<Self> {
        let previous = env::current_dir()?;
        env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.previous) {
            warn!(dir = %self.previous.display(), "failed to restore working directory: {e}");
        }
    }
}

/// Best available device: the first CUDA device, else the CPU.
#[must_use]
pub fn best_device() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}

/// Unpack a packaged archive and load its configuration and weights.
///
/// The archive is unpacked into a temporary directory, which is removed
/// afterwards; the working directory is restored on every exit path.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or lacks either member.
pub fn extract_config_and_state_dict(path: &Path, device: &Device) -> Result<(Value, StateDict)> {
    let tmpdir = tempfile::tempdir()?;
    ZipArchive::new(File::open(path)?)?.extract(tmpdir.path())?;

    let config = {
        let _cwd = WorkingDirGuard::enter(tmpdir.path())?;
        serde_yaml::from_str(&fs::read_to_string(MODEL_CONFIG_YAML)?)?
    };
    let state_dict = candle_core::safetensors::load(tmpdir.path().join(MODEL_WEIGHTS_CKPT), device)?;
    debug!(path = %path.display(), tensors = state_dict.len(), "extracted archive");
    Ok((config, state_dict))
}

/// Read only the configuration document of a packaged archive.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or has no configuration.
pub fn extract_config(path: &Path) -> Result<Value> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut text = String::new();
    archive.by_name(MODEL_CONFIG_YAML)?.read_to_string(&mut text)?;
    Ok(serde_yaml::from_str(&text)?)
}

/// Write a packaged archive.
///
/// # Errors
///
/// Returns an error if serialization or file writing fails.
pub fn pack_archive(path: &Path, config: &Value, state_dict: &StateDict) -> Result<()> {
    let weights = safetensors::tensor::serialize(
        state_dict.iter().map(|(name, tensor)| (name.as_str(), tensor.clone())),
        &None,
    )?;

    let mut zip = ZipWriter::new(File::create(path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(MODEL_CONFIG_YAML, options)?;
    zip.write_all(serde_yaml::to_string(config)?.as_bytes())?;
    zip.start_file(MODEL_WEIGHTS_CKPT, options)?;
    zip.write_all(&weights)?;
    zip.finish()?;
    Ok(())
}

/// Read an adapter-only weights file.
///
/// # Errors
///
/// Returns [`PeftError::WeightLoad`] if a tensor is not under
/// [`ADAPTER_STATE_KEY`], or an I/O / format error.
pub fn load_adapter_file(path: &Path, device: &Device) -> Result<StateDict> {
    let prefix = format!("{ADAPTER_STATE_KEY}.");
    candle_core::safetensors::load(path, device)?
        .into_iter()
        .map(|(name, tensor)| {
            let key = name.strip_prefix(&prefix).ok_or_else(|| {
                PeftError::WeightLoad(format!("'{name}' is not under '{ADAPTER_STATE_KEY}'"))
            })?;
            Ok((key.to_string(), tensor))
        })
        .collect()
}

fn save_adapter_file(path: &Path, state_dict: &StateDict) -> Result<()> {
    let tensors: Vec<(String, Tensor)> = state_dict
        .iter()
        .map(|(key, tensor)| (format!("{ADAPTER_STATE_KEY}.{key}"), tensor.clone()))
        .collect();
    safetensors::tensor::serialize_to_file(tensors, &None, path)?;
    Ok(())
}

impl PeftModel {
    /// Save only the adapter parameters (canonical keys) to an adapter-only
    /// weights file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file writing fails.
    pub fn save_adapters(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let state_dict = self.peft_state_dict()?;
        save_adapter_file(path, &state_dict)?;
        info!(path = %path.display(), tensors = state_dict.len(), "saved adapters");
        Ok(())
    }

    /// Pack the configuration and the current [`Self::state_dict`] into an
    /// archive.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file writing fails.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        pack_archive(path, self.cfg(), &self.state_dict()?)?;
        info!(path = %path.display(), "saved archive");
        Ok(())
    }

    /// Inject `peft_cfgs` and restore their weights from `path` (`.nemo`
    /// archive or `.ckpt` adapter file).
    ///
    /// Tensors are read onto `map_location`, or the best available device.
    ///
    /// # Errors
    ///
    /// - [`PeftError::Configuration`] for any other file extension
    /// - [`PeftError::KeyMismatch`] unless the file holds exactly the injected
    ///   adapter keys
    /// - any injection error
    pub fn load_adapters(
        &mut self,
        path: impl AsRef<Path>,
        peft_cfgs: &[PeftConfig],
        map_location: Option<&Device>,
    ) -> Result<()> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if !matches!(extension, "nemo" | "ckpt") {
            return Err(PeftError::Configuration(format!(
                "{} is not a .nemo or .ckpt file",
                path.display()
            )));
        }

        self.inject(peft_cfgs)?;
        let device = map_location.cloned().unwrap_or_else(best_device);
        let state_dict = if extension == "nemo" {
            extract_config_and_state_dict(path, &device)?.1
        } else {
            load_adapter_file(path, &device)?
        };

        self.canonical_adapter_keys()
            .ensure_matches(&KeySet::capture(state_dict.keys().cloned()))?;
        self.assign_canonical(&state_dict)?;
        info!(path = %path.display(), tensors = state_dict.len(), "loaded adapters");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::DType;
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::config::{AdapterTuning, LoraTuning};
    use crate::testing::{dims, lora, native_model};

    fn values(state_dict: &StateDict) -> anyhow::Result<HashMap<String, Vec<f32>>> {
        state_dict
            .iter()
            .map(|(k, t)| Ok((k.clone(), t.flatten_all()?.to_vec1::<f32>()?)))
            .collect()
    }

    #[test]
    #[serial]
    fn test_pack_and_extract() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.nemo");
        let config: Value = serde_yaml::from_str("precision: 16\nhidden_size: 8\n")?;
        let mut state_dict = StateDict::new();
        state_dict.insert("model.w".into(), Tensor::arange(0f32, 6f32, &Device::Cpu)?.reshape((2, 3))?);

        pack_archive(&path, &config, &state_dict)?;
        let cwd = env::current_dir()?;
        let (loaded_config, loaded) = extract_config_and_state_dict(&path, &Device::Cpu)?;
        assert_eq!(env::current_dir()?, cwd);
        assert_eq!(loaded_config, config);
        assert_eq!(values(&loaded)?, values(&state_dict)?);
        assert_eq!(extract_config(&path)?, config);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_extract_restores_cwd_on_failure() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("broken.nemo");
        let mut zip = ZipWriter::new(File::create(&path)?);
        zip.start_file(MODEL_CONFIG_YAML, SimpleFileOptions::default())?;
        zip.write_all(b"key: [unterminated")?;
        zip.finish()?;

        let cwd = env::current_dir()?;
        assert!(extract_config_and_state_dict(&path, &Device::Cpu).is_err());
        assert_eq!(env::current_dir()?, cwd);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_working_dir_guard() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cwd = env::current_dir()?;
        {
            let _guard = WorkingDirGuard::enter(dir.path())?;
            assert_eq!(env::current_dir()?.canonicalize()?, dir.path().canonicalize()?);
        }
        assert_eq!(env::current_dir()?, cwd);
        Ok(())
    }

    #[test]
    fn test_adapter_file_layout() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("adapters.ckpt");
        let mut model = native_model(1)?;
        model.inject(&[lora()?])?;
        model.save_adapters(&path)?;

        let raw = candle_core::safetensors::load(&path, &Device::Cpu)?;
        assert!(raw.keys().all(|k| k.starts_with("state_dict.model.decoder.")));
        assert_eq!(
            KeySet::capture(load_adapter_file(&path, &Device::Cpu)?.into_keys()),
            model.canonical_adapter_keys()
        );
        Ok(())
    }

    #[test]
    fn test_save_load_adapters_round_trip() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("adapters.ckpt");
        let tuning = LoraTuning {
            adapter_dim: 4,
            target_modules: vec!["all".into()],
            ..LoraTuning::default()
        };

        let mut trained = native_model(2)?;
        trained.inject(&[crate::PeftConfig::lora(&dims(), &tuning)?])?;
        trained.mark_setup_complete()?;
        // Give the zero-initialized projections distinct values.
        let noisy: StateDict = trained
            .state_dict()?
            .into_iter()
            .map(|(k, t)| Ok((k, t.randn_like(0.0, 1.0)?)))
            .collect::<crate::Result<_>>()?;
        trained.load_state_dict(&noisy)?;
        let before = values(&trained.state_dict()?)?;
        trained.save_adapters(&path)?;

        let mut fresh = native_model(2)?;
        fresh.load_adapters(&path, &[crate::PeftConfig::lora(&dims(), &tuning)?], Some(&Device::Cpu))?;
        fresh.mark_setup_complete()?;
        assert_eq!(values(&fresh.state_dict()?)?, before);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_load_adapters_from_archive() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("peft.nemo");
        let mut trained = native_model(2)?;
        trained.inject(&[lora()?])?;
        trained.mark_setup_complete()?;
        trained.save_to(&path)?;

        let (config, _) = extract_config_and_state_dict(&path, &Device::Cpu)?;
        assert!(crate::topology::has_adapter(&config, crate::adapters::names::LORA_KQV));

        let mut fresh = native_model(2)?;
        fresh.load_adapters(&path, &[lora()?], None)?;
        fresh.mark_setup_complete()?;
        assert_eq!(values(&fresh.state_dict()?)?, values(&trained.state_dict()?)?);
        Ok(())
    }

    #[test]
    fn test_load_adapters_rejects_other_topology() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("adapters.ckpt");
        let mut trained = native_model(1)?;
        trained.inject(&[lora()?])?;
        trained.save_adapters(&path)?;

        let canonical = crate::PeftConfig::canonical_adapters(
            &dims(),
            &AdapterTuning {
                adapter_dim: 4,
                ..AdapterTuning::default()
            },
        )?;
        let mut fresh = native_model(1)?;
        let result = fresh.load_adapters(&path, &[canonical], Some(&Device::Cpu));
        assert!(matches!(result, Err(PeftError::KeyMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_load_adapters_unknown_extension() -> anyhow::Result<()> {
        let mut model = native_model(1)?;
        let result = model.load_adapters("adapters.bin", &[lora()?], None);
        assert!(matches!(result, Err(PeftError::Configuration(_))));
        assert!(!model.state().use_peft());
        Ok(())
    }

    #[test]
    fn test_load_adapter_file_requires_namespace() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("plain.ckpt");
        let tensors = vec![("w".to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu)?)];
        safetensors::tensor::serialize_to_file(tensors, &None, &path)?;
        assert!(matches!(
            load_adapter_file(&path, &Device::Cpu),
            Err(PeftError::WeightLoad(_))
        ));
        Ok(())
    }
}
