//! Export trained weights and the resolved configuration for serving.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_nn::VarMap;
use seqrun_core::{checkpoint_error, IoResultExt, Result, RunConfig};

use crate::checkpoint::MODEL_FILE;

pub const CONFIG_FILE: &str = "config.toml";

/// Default export base: `model_dir/export/manual`.
pub fn default_export_base(config: &RunConfig) -> PathBuf {
    config.model_dir.join("export").join("manual")
}

/// Write `model.safetensors` and `config.toml` into a fresh timestamped
/// subdirectory of `base` and return it.
pub fn export(varmap: &VarMap, config: &RunConfig, base: &Path) -> Result<PathBuf> {
    let dir = fresh_subdir(base)?;
    let model_path = dir.join(MODEL_FILE);
    varmap
        .save(&model_path)
        .map_err(|e| checkpoint_error(e.to_string(), &model_path))?;
    config.save(dir.join(CONFIG_FILE))?;
    tracing::info!(path = %dir.display(), "Exported model");
    Ok(dir)
}

fn fresh_subdir(base: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(base).with_path(base)?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut dir = base.join(stamp.to_string());
    let mut suffix = 1;
    while dir.exists() {
        dir = base.join(format!("{}_{}", stamp, suffix));
        suffix += 1;
    }
    std::fs::create_dir(&dir).with_path(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    #[test]
    fn test_export_writes_fresh_directories() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let config = RunConfig::new(tmp.path().join("run"));
        let varmap = VarMap::new();
        varmap.get((2, 2), "w", Init::Const(0.5), DType::F32, &Device::Cpu)?;

        let base = default_export_base(&config);
        let first = export(&varmap, &config, &base)?;
        let second = export(&varmap, &config, &base)?;
        assert_ne!(first, second);
        assert!(first.starts_with(tmp.path().join("run/export/manual")));

        for dir in [&first, &second] {
            let tensors = candle_core::safetensors::load(dir.join(MODEL_FILE), &Device::Cpu)?;
            assert_eq!(tensors["w"].to_vec2::<f32>()?, vec![vec![0.5, 0.5]; 2]);
            let reloaded = RunConfig::load(&[dir.join(CONFIG_FILE)], None)?;
            assert_eq!(reloaded.model_dir, config.model_dir);
        }
        Ok(())
    }
}
