//! End-to-end runs of the token tagger through the runner facade.

use std::path::{Path, PathBuf};

use seqrun_core::{ProcessRole, Result};
use seqrun_cli::{Runner, RunnerOptions};
use seqrun_train::checkpoint::list_records;
use seqrun_train::toy::TokenTaggerFactory;

const SOURCES: [&str; 6] = ["a b", "b c a", "c", "a a b", "b", "c c"];
const TARGETS: [&str; 6] = ["x y", "y z x", "z", "x x y", "y", "z z"];

fn write_lines(path: &Path, lines: &[&str]) -> Result<()> {
    std::fs::write(path, lines.join("\n") + "\n")?;
    Ok(())
}

/// Write vocabularies, data files and a configuration into `dir`.
fn setup(dir: &Path, extra: &str) -> Result<PathBuf> {
    write_lines(&dir.join("src.vocab"), &["a", "b", "c"])?;
    write_lines(&dir.join("tgt.vocab"), &["x", "y", "z"])?;
    write_lines(&dir.join("train.src"), &SOURCES)?;
    write_lines(&dir.join("train.tgt"), &TARGETS)?;

    let config = format!(
        r#"
model_dir = "{dir}/run"

[data]
train_features_file = "{dir}/train.src"
train_labels_file = "{dir}/train.tgt"
eval_features_file = "{dir}/train.src"
eval_labels_file = "{dir}/train.tgt"
source_vocabulary = "{dir}/src.vocab"
target_vocabulary = "{dir}/tgt.vocab"

[params]
learning_rate = 0.01
hidden_size = 8
maximum_decoding_length = 5

[train]
batch_size = 2
train_steps = 4
save_checkpoints_steps = 2
keep_checkpoint_max = 3
save_summary_steps = 1

[eval]
batch_size = 4
eval_delay = 0
{extra}
"#,
        dir = dir.display(),
        extra = extra,
    );
    let path = dir.join("run.toml");
    std::fs::write(&path, config)?;
    Ok(path)
}

fn runner(config: &Path) -> Result<Runner<TokenTaggerFactory>> {
    let options = RunnerOptions {
        seed: Some(7),
        ..RunnerOptions::default()
    };
    Ok(Runner::new(TokenTaggerFactory, &[config], options)?.with_role(ProcessRole::Chief))
}

fn steps(dir: &Path) -> Result<Vec<usize>> {
    Ok(list_records(dir)?.iter().map(|r| r.step).collect())
}

#[test]
fn test_train_then_infer_score_and_export() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = setup(tmp.path(), "")?;
    let runner = runner(&config)?;
    let model_dir = runner.config().model_dir.clone();

    let output_dir = runner.train(None)?;
    assert_eq!(output_dir, model_dir);
    assert_eq!(steps(&model_dir)?, vec![2, 4]);

    let predictions = tmp.path().join("out/predictions.txt");
    runner.infer(&tmp.path().join("train.src"), Some(predictions.as_path()), None, true)?;
    let predicted = std::fs::read_to_string(&predictions)?;
    assert_eq!(predicted.lines().count(), SOURCES.len());
    for line in predicted.lines() {
        assert!(line.split(' ').filter(|t| !t.is_empty()).count() <= 5, "line {:?}", line);
    }

    let scores = tmp.path().join("scores.txt");
    runner.score(
        &tmp.path().join("train.src"),
        Some(tmp.path().join("train.tgt").as_path()),
        None,
        Some(scores.as_path()),
    )?;
    let scored = std::fs::read_to_string(&scores)?;
    let sentences: Vec<&str> = scored
        .lines()
        .map(|line| line.split(" ||| ").nth(1).unwrap_or(""))
        .collect();
    assert_eq!(sentences, TARGETS);

    let exported = runner.export(None, None)?;
    assert!(exported.starts_with(model_dir.join("export/manual")));
    assert!(exported.join("model.safetensors").is_file());
    assert!(exported.join("config.toml").is_file());

    let evaluation = runner.evaluate(None)?;
    assert_eq!(evaluation.step, 4);
    assert!(evaluation.loss.is_finite());
    Ok(())
}

#[test]
fn test_training_resumes_and_averages() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = setup(tmp.path(), "")?;
    let model_dir = runner(&config)?.config().model_dir.clone();
    runner(&config)?.train(None)?;

    // A second run with a later stop resumes from step 4.
    let mut text = std::fs::read_to_string(&config)?;
    text = text.replace("train_steps = 4", "train_steps = 6\naverage_last_checkpoints = 2");
    std::fs::write(&config, text)?;
    let output_dir = runner(&config)?.train(None)?;

    assert_eq!(output_dir, model_dir.join("avg"));
    assert_eq!(steps(&model_dir)?, vec![2, 4, 6]);
    let averaged = list_records(&output_dir)?;
    assert_eq!(averaged.len(), 1);
    assert_eq!(averaged[0].meta()?.averaged_from, vec![6, 4]);

    let explicit = runner(&config)?.average_checkpoints(&tmp.path().join("avg3"), 3)?;
    assert_eq!(list_records(&explicit)?[0].meta()?.averaged_from, vec![6, 4, 2]);
    Ok(())
}

#[test]
fn test_train_and_evaluate_runs_exporters() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = setup(tmp.path(), "exporters = [\"last\", \"final\"]")?;
    let runner = runner(&config)?;
    let model_dir = runner.config().model_dir.clone();

    let outcome = runner.train_and_evaluate(None)?;
    let evaluated: Vec<usize> = outcome.evaluations.iter().map(|e| e.step).collect();
    assert_eq!(evaluated, vec![2, 4]);
    assert_eq!(outcome.output_dir, model_dir);
    assert_eq!(outcome.exports.len(), 2);
    assert!(outcome.exports[0].starts_with(model_dir.join("export/latest")));
    assert!(outcome.exports[1].starts_with(model_dir.join("export/final")));
    Ok(())
}

#[test]
fn test_non_chief_writes_no_checkpoints() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = setup(tmp.path(), "")?;
    let runner = runner(&config)?.with_role(ProcessRole::Worker { index: 1 });
    let output_dir = runner.train(None)?;
    assert_eq!(steps(&output_dir)?, Vec::<usize>::new());
    Ok(())
}

#[test]
fn test_scoring_a_supervised_model_needs_predictions() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = setup(tmp.path(), "")?;
    let runner = runner(&config)?;
    let err = runner
        .score(&tmp.path().join("train.src"), None, None, None)
        .unwrap_err();
    assert!(err.is_configuration());
    Ok(())
}

#[test]
fn test_inference_without_checkpoint_fails() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = setup(tmp.path(), "")?;
    let err = runner(&config)?
        .infer(&tmp.path().join("train.src"), None, None, false)
        .unwrap_err();
    assert!(matches!(err, seqrun_core::RunnerError::CheckpointNotFound(_)));
    Ok(())
}
