//! Integration tests for layered configuration loading.

use seqrun_core::{BatchType, ExporterKind, Result, RunConfig, ScorerKind};
use std::path::PathBuf;

fn write(dir: &std::path::Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_user_files_merge_in_order() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let base = write(
        dir.path(),
        "base.toml",
        r#"
        model_dir = "base_run"
        [train]
        batch_size = 128
        batch_type = "tokens"
        [eval]
        exporters = ["last", "final"]
        "#,
    );
    let overrides = write(
        dir.path(),
        "override.toml",
        r#"
        model_dir = "final_run"
        [train]
        batch_size = 256
        "#,
    );

    let auto: toml::Value = toml::from_str(
        r#"
        [train]
        batch_size = 64
        effective_batch_size = 4096
        [params]
        learning_rate = 2.0
        "#,
    )
    .unwrap();

    let cfg = RunConfig::load(&[base, overrides], Some(auto))?;
    assert_eq!(cfg.model_dir, PathBuf::from("final_run"));
    assert_eq!(cfg.train.batch_size, Some(256));
    assert_eq!(cfg.train.batch_type, BatchType::Tokens);
    assert_eq!(cfg.train.effective_batch_size, Some(4096));
    assert_eq!(cfg.params.learning_rate, 2.0);
    assert_eq!(cfg.eval.exporters, vec![ExporterKind::Last, ExporterKind::Final]);
    assert_eq!(cfg.params.adam_beta2, 0.998);
    Ok(())
}

#[test]
fn test_best_exporter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "cfg.toml",
        "model_dir = \"run\"\n[eval]\nexporters = [\"best\"]\n",
    );
    assert!(RunConfig::load(&[path], None).is_err());
}

#[test]
fn test_external_evaluators() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "cfg.toml",
        "model_dir = \"run\"\n[eval]\nexternal_evaluators = [\"bleu\", \"accuracy\"]\n",
    );
    let cfg = RunConfig::load(&[path], None)?;
    assert_eq!(cfg.eval.external_evaluators, vec![ScorerKind::Bleu, ScorerKind::Accuracy]);
    assert!(RunConfig::new("run").eval.external_evaluators.is_empty());
    Ok(())
}

#[test]
fn test_missing_file_reports_path() {
    let err = RunConfig::load(&["/nonexistent/seqrun.toml"], None).unwrap_err();
    assert_eq!(err.path(), Some("/nonexistent/seqrun.toml"));
}

#[test]
fn test_invalid_values_are_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "cfg.toml",
        "model_dir = \"run\"\n[train]\nkeep_checkpoint_max = 0\n",
    );
    let err = RunConfig::load(&[path], None).unwrap_err();
    assert!(err.is_configuration());
}
