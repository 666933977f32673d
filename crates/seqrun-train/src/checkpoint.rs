//! Checkpoint records: save, prune, restore and average.
//!
//! A record is a `step_<N>` directory holding:
//!   - `model.safetensors`: model variables
//!   - `optimizer.safetensors`: optimizer slots
//!   - `meta.json`: step and bookkeeping, written last
//!
//! A directory without `meta.json` is an incomplete write and is never
//! listed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use seqrun_core::{checkpoint_error, config_error, IoResultExt, Result, RunnerError};

use crate::logging::log_checkpoint_save;
use crate::optim::{named_variables, Optimizer};

pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const META_FILE: &str = "meta.json";
const RECORD_PREFIX: &str = "step_";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: usize,
    pub loss: Option<f64>,
    pub created_unix_secs: u64,
    /// Steps of the records this one was averaged from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub averaged_from: Vec<usize>,
}

/// A complete checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub step: usize,
    pub path: PathBuf,
}

impl CheckpointRecord {
    pub fn model_path(&self) -> PathBuf {
        self.path.join(MODEL_FILE)
    }

    pub fn optimizer_path(&self) -> PathBuf {
        self.path.join(OPTIMIZER_FILE)
    }

    pub fn meta(&self) -> Result<CheckpointMeta> {
        let path = self.path.join(META_FILE);
        let json = std::fs::read_to_string(&path).with_path(&path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Owns the records of one checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep_max: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, keep_max: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_max: keep_max.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keep_max(&self) -> usize {
        self.keep_max
    }

    /// Records of this directory, oldest first.
    pub fn records(&self) -> Result<Vec<CheckpointRecord>> {
        list_records(&self.dir)
    }

    pub fn latest(&self) -> Result<Option<CheckpointRecord>> {
        Ok(list_records(&self.dir)?.pop())
    }

    /// Persist model and optimizer state as the record for `step`, then
    /// prune the oldest records beyond `keep_max`.
    pub fn save(
        &self,
        varmap: &VarMap,
        optimizer: &dyn Optimizer,
        step: usize,
        loss: Option<f64>,
    ) -> Result<CheckpointRecord> {
        let record = self.write_record(varmap, &optimizer.state_tensors(), step, loss, Vec::new())?;
        self.prune()?;
        Ok(record)
    }

    /// Write the record for `step`, replacing one with the same step.
    /// Other records of the directory are left alone.
    fn write_record(
        &self,
        varmap: &VarMap,
        optimizer_state: &HashMap<String, Tensor>,
        step: usize,
        loss: Option<f64>,
        averaged_from: Vec<usize>,
    ) -> Result<CheckpointRecord> {
        let record = CheckpointRecord {
            step,
            path: self.dir.join(format!("{}{}", RECORD_PREFIX, step)),
        };
        if record.path.exists() {
            std::fs::remove_dir_all(&record.path).with_path(&record.path)?;
        }
        std::fs::create_dir_all(&record.path).with_path(&record.path)?;

        varmap
            .save(record.model_path())
            .map_err(|e| checkpoint_error(e.to_string(), record.model_path()))?;
        candle_core::safetensors::save(optimizer_state, record.optimizer_path())
            .map_err(|e| checkpoint_error(e.to_string(), record.optimizer_path()))?;

        let meta = CheckpointMeta {
            step,
            loss,
            created_unix_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            averaged_from,
        };
        let meta_path = record.path.join(META_FILE);
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?).with_path(&meta_path)?;

        log_checkpoint_save(step, &record.path.display().to_string(), loss);
        Ok(record)
    }

    /// Remove the oldest records so that at most `keep_max` remain.
    pub fn prune(&self) -> Result<Vec<CheckpointRecord>> {
        let records = self.records()?;
        let excess = records.len().saturating_sub(self.keep_max);
        let removed: Vec<CheckpointRecord> = records.into_iter().take(excess).collect();
        for record in &removed {
            tracing::debug!(step = record.step, path = %record.path.display(), "Removing old checkpoint");
            std::fs::remove_dir_all(&record.path).with_path(&record.path)?;
        }
        Ok(removed)
    }

    /// Load a record into `varmap` (and `optimizer`, if given) in place.
    ///
    /// `location` may be a record directory or a checkpoint directory, in
    /// which case its latest record is used.
    pub fn restore(
        varmap: &VarMap,
        optimizer: Option<&mut dyn Optimizer>,
        location: &Path,
    ) -> Result<CheckpointRecord> {
        let record = resolve_record(location)?;
        load_variables(varmap, &record.model_path())?;
        if let Some(optimizer) = optimizer {
            let path = record.optimizer_path();
            let state = if path.exists() {
                candle_core::safetensors::load(&path, &Device::Cpu)
                    .map_err(|e| checkpoint_error(e.to_string(), &path))?
            } else {
                tracing::warn!(
                    path = %record.path.display(),
                    "Optimizer state not found in checkpoint; using fresh optimizer slots"
                );
                optimizer.state_tensors()
            };
            optimizer.load_state(&state, record.step)?;
        }
        tracing::info!(step = record.step, path = %record.path.display(), "Restored checkpoint");
        Ok(record)
    }

    /// Average the newest `max_count` records of `source_dir` into a new
    /// record under `output_dir`.
    ///
    /// `varmap` and `optimizer` must already hold every variable. They are
    /// overwritten with the averaged values and the optimizer state of the
    /// newest record. Source records are only read, and records already in
    /// `output_dir` are kept.
    pub fn average(
        source_dir: &Path,
        output_dir: &Path,
        max_count: usize,
        varmap: &VarMap,
        optimizer: &mut dyn Optimizer,
    ) -> Result<PathBuf> {
        if output_dir == source_dir {
            return Err(config_error(format!(
                "averaged checkpoint must not be written into its source directory '{}'",
                source_dir.display()
            )));
        }
        let mut records = list_records(source_dir)?;
        if records.is_empty() || max_count == 0 {
            return Err(RunnerError::EmptyCheckpointSet(source_dir.display().to_string()));
        }
        records.reverse();
        records.truncate(max_count);
        let steps: Vec<usize> = records.iter().map(|r| r.step).collect();
        tracing::info!(?steps, output = %output_dir.display(), "Averaging checkpoints");

        let newest = records[0].clone();
        Self::restore(varmap, Some(&mut *optimizer), &newest.path)?;

        let named = named_variables(varmap)?;
        let mut sums: HashMap<String, Tensor> = HashMap::with_capacity(named.len());
        for record in &records {
            let tensors = candle_core::safetensors::load(record.model_path(), &Device::Cpu)
                .map_err(|e| checkpoint_error(e.to_string(), record.model_path()))?;
            for (name, _) in &named {
                let value = tensors
                    .get(name)
                    .ok_or_else(|| {
                        checkpoint_error(format!("variable '{}' is missing", name), &record.path)
                    })?
                    .to_dtype(candle_core::DType::F64)?;
                let sum = match sums.remove(name) {
                    Some(sum) => (sum + value)?,
                    None => value,
                };
                sums.insert(name.clone(), sum);
            }
        }

        let count = records.len() as f64;
        for (name, var) in &named {
            let sum = sums
                .remove(name)
                .ok_or_else(|| checkpoint_error(format!("variable '{}' is missing", name), source_dir))?;
            let mean = (sum / count)?.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&mean)?;
        }

        let output = CheckpointManager::new(output_dir, 1);
        let meta = newest.meta()?;
        output.write_record(
            varmap,
            &optimizer.state_tensors(),
            newest.step,
            meta.loss,
            steps,
        )?;
        Ok(output_dir.to_path_buf())
    }
}

/// Set every variable of `varmap` from a safetensors file.
///
/// Fails if a variable is missing or has a different shape.
pub fn load_variables(varmap: &VarMap, path: &Path) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| checkpoint_error(e.to_string(), path))?;
    for (name, var) in named_variables(varmap)? {
        let value = tensors
            .get(&name)
            .ok_or_else(|| checkpoint_error(format!("variable '{}' is missing", name), path))?;
        if value.dims() != var.as_tensor().dims() {
            return Err(checkpoint_error(
                format!(
                    "variable '{}' has shape {:?}, expected {:?}",
                    name,
                    value.dims(),
                    var.as_tensor().dims()
                ),
                path,
            ));
        }
        var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)?;
    }
    Ok(())
}

/// Complete records of `dir`, oldest first. A missing directory has none.
pub fn list_records(dir: &Path) -> Result<Vec<CheckpointRecord>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir).with_path(dir)? {
        let path = entry.with_path(dir)?.path();
        if !path.join(META_FILE).is_file() {
            continue;
        }
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(RECORD_PREFIX))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(step) = step {
            records.push(CheckpointRecord { step, path });
        }
    }
    records.sort_by_key(|r| r.step);
    Ok(records)
}

/// The latest record of `dir`, if any.
pub fn latest_record(dir: &Path) -> Result<Option<CheckpointRecord>> {
    Ok(list_records(dir)?.pop())
}

/// Resolve a record directory, or the latest record of a checkpoint directory.
pub fn resolve_record(location: &Path) -> Result<CheckpointRecord> {
    if location.join(META_FILE).is_file() {
        let meta: CheckpointMeta = {
            let path = location.join(META_FILE);
            let json = std::fs::read_to_string(&path).with_path(&path)?;
            serde_json::from_str(&json)?
        };
        return Ok(CheckpointRecord {
            step: meta.step,
            path: location.to_path_buf(),
        });
    }
    latest_record(location)?
        .ok_or_else(|| RunnerError::CheckpointNotFound(location.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{Adam, LearningRate};
    use candle_core::DType;

    fn model(init: f64) -> Result<(VarMap, Adam)> {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "w", candle_nn::Init::Const(init))?;
        let adam = Adam::new(
            named_variables(&varmap)?,
            LearningRate::Constant(0.1),
            (0.9, 0.999),
            1e-8,
        )?;
        Ok((varmap, adam))
    }

    fn set_w(varmap: &VarMap, value: f32) -> Result<()> {
        let (_, var) = named_variables(varmap)?.remove(0);
        var.set(&Tensor::new(&[value; 3], &Device::Cpu)?)?;
        Ok(())
    }

    fn w(varmap: &VarMap) -> Result<Vec<f32>> {
        let (_, var) = named_variables(varmap)?.remove(0);
        Ok(var.as_tensor().to_vec1::<f32>()?)
    }

    #[test]
    fn test_save_writes_complete_record() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, adam) = model(1.0)?;
        let manager = CheckpointManager::new(dir.path(), 3);
        let record = manager.save(&varmap, &adam, 42, Some(3.5))?;

        assert_eq!(record.step, 42);
        assert!(record.model_path().is_file());
        assert!(record.optimizer_path().is_file());
        let meta = record.meta()?;
        assert_eq!(meta.step, 42);
        assert_eq!(meta.loss, Some(3.5));
        Ok(())
    }

    #[test]
    fn test_incomplete_records_are_ignored() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("step_7")).unwrap();
        std::fs::create_dir_all(dir.path().join("unrelated")).unwrap();
        assert!(list_records(dir.path())?.is_empty());
        assert!(matches!(
            resolve_record(dir.path()),
            Err(RunnerError::CheckpointNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_restore_in_place() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, mut adam) = model(1.0)?;
        let manager = CheckpointManager::new(dir.path(), 3);
        adam.apply_gradients(&[Tensor::new(&[1f32, 1.0, 1.0], &Device::Cpu)?])?;
        manager.save(&varmap, &adam, 1, None)?;
        let saved = w(&varmap)?;

        set_w(&varmap, 7.0)?;
        let (_, mut fresh) = model(0.0)?;
        let record = CheckpointManager::restore(&varmap, Some(&mut fresh), dir.path())?;
        assert_eq!(record.step, 1);
        assert_eq!(w(&varmap)?, saved);
        Ok(())
    }

    #[test]
    fn test_average_rejects_empty_source() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, mut adam) = model(1.0)?;
        let err = CheckpointManager::average(
            dir.path(),
            &dir.path().join("avg"),
            4,
            &varmap,
            &mut adam,
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::EmptyCheckpointSet(_)));
        Ok(())
    }

    #[test]
    fn test_average_takes_newest_records() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, mut adam) = model(0.0)?;
        let manager = CheckpointManager::new(dir.path(), 10);
        for (step, value) in [(1, 100.0f32), (2, 2.0), (3, 4.0)] {
            set_w(&varmap, value)?;
            manager.save(&varmap, &adam, step, None)?;
        }

        let avg_dir = dir.path().join("avg");
        let out = CheckpointManager::average(dir.path(), &avg_dir, 2, &varmap, &mut adam)?;
        assert_eq!(out, avg_dir);
        assert_eq!(w(&varmap)?, vec![3.0, 3.0, 3.0]);

        let averaged = latest_record(&avg_dir)?.unwrap();
        assert_eq!(averaged.step, 3);
        assert_eq!(averaged.meta()?.averaged_from, vec![3, 2]);
        assert_eq!(list_records(dir.path())?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_average_keeps_existing_output_records() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("run");
        let avg_dir = dir.path().join("avg");
        let (varmap, mut adam) = model(1.0)?;
        let output = CheckpointManager::new(&avg_dir, 10);
        output.save(&varmap, &adam, 20, None)?;
        output.save(&varmap, &adam, 30, None)?;
        let manager = CheckpointManager::new(&source, 10);
        manager.save(&varmap, &adam, 2, None)?;
        manager.save(&varmap, &adam, 3, None)?;

        CheckpointManager::average(&source, &avg_dir, 2, &varmap, &mut adam)?;
        let steps: Vec<usize> = list_records(&avg_dir)?.iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![3, 20, 30]);
        Ok(())
    }

    #[test]
    fn test_save_prunes_oldest_records() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, adam) = model(1.0)?;
        let manager = CheckpointManager::new(dir.path(), 2);
        for step in 1..=4 {
            manager.save(&varmap, &adam, step, None)?;
        }
        let steps: Vec<usize> = manager.records()?.iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![3, 4]);
        Ok(())
    }

    #[test]
    fn test_average_of_identical_records_is_identity() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, mut adam) = model(0.0)?;
        let manager = CheckpointManager::new(dir.path(), 10);
        set_w(&varmap, 0.37)?;
        for step in 1..=4 {
            manager.save(&varmap, &adam, step, None)?;
        }
        set_w(&varmap, -5.0)?;

        CheckpointManager::average(dir.path(), &dir.path().join("avg"), 4, &varmap, &mut adam)?;
        for value in w(&varmap)? {
            assert!((value - 0.37).abs() < 1e-6);
        }
        Ok(())
    }
}
