//! Process role in a multi-process run.
//!
//! A cluster descriptor is a JSON object `{"task": {"type": "...", "index": N}}`
//! read from `SEQRUN_CLUSTER_SPEC`. Without a descriptor the process is the
//! chief of a single-process run. Only the `chief` task type is chief.

use serde::Deserialize;

use crate::error::Result;

/// Environment variable holding the cluster descriptor.
pub const CLUSTER_SPEC_ENV: &str = "SEQRUN_CLUSTER_SPEC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Owns checkpoint writes, pruning and averaging.
    Chief,
    Worker { index: usize },
}

impl ProcessRole {
    pub fn is_chief(&self) -> bool {
        matches!(self, ProcessRole::Chief)
    }

    /// Resolve the role of the current process from the environment.
    pub fn from_env() -> Result<Self> {
        let spec = std::env::var(CLUSTER_SPEC_ENV).ok();
        Self::from_cluster_spec(spec.as_deref())
    }

    /// Resolve the role from an optional JSON cluster descriptor.
    pub fn from_cluster_spec(spec: Option<&str>) -> Result<Self> {
        let spec = match spec.map(str::trim) {
            None | Some("") => return Ok(ProcessRole::Chief),
            Some(spec) => spec,
        };
        let descriptor: ClusterSpec = serde_json::from_str(spec)?;
        let Some(task) = descriptor.task else {
            return Ok(ProcessRole::Chief);
        };
        if task.kind == "chief" {
            return Ok(ProcessRole::Chief);
        }
        Ok(ProcessRole::Worker {
            index: task.index.unwrap_or(0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ClusterSpec {
    task: Option<TaskSpec>,
}

#[derive(Debug, Deserialize)]
struct TaskSpec {
    #[serde(rename = "type")]
    kind: String,
    index: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_descriptor_is_chief() {
        assert_eq!(ProcessRole::from_cluster_spec(None).unwrap(), ProcessRole::Chief);
        assert_eq!(ProcessRole::from_cluster_spec(Some("  ")).unwrap(), ProcessRole::Chief);
        assert_eq!(ProcessRole::from_cluster_spec(Some("{}")).unwrap(), ProcessRole::Chief);
    }

    #[test]
    fn test_worker_descriptor() {
        let role =
            ProcessRole::from_cluster_spec(Some(r#"{"task": {"type": "worker", "index": 2}}"#))
                .unwrap();
        assert_eq!(role, ProcessRole::Worker { index: 2 });
        assert!(!role.is_chief());
    }

    #[test]
    fn test_chief_descriptor() {
        let role = ProcessRole::from_cluster_spec(Some(r#"{"task": {"type": "chief"}}"#)).unwrap();
        assert!(role.is_chief());
    }

    #[test]
    fn test_other_task_types_are_not_chief() {
        for kind in ["master", "evaluator", "ps", "oracle"] {
            let spec = format!(r#"{{"task": {{"type": "{}", "index": 1}}}}"#, kind);
            let role = ProcessRole::from_cluster_spec(Some(&spec)).unwrap();
            assert_eq!(role, ProcessRole::Worker { index: 1 }, "type {}", kind);
        }
    }

    #[test]
    fn test_malformed_descriptor_is_rejected() {
        assert!(ProcessRole::from_cluster_spec(Some("not json")).is_err());
    }
}
