//! Failure artifacts under `<artifacts.dir>/<run-id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::snapshot::StateSnapshot;
use crate::core::trace::ActionTrace;
use crate::engine::RunFailure;
use crate::io::config::write_atomic;

/// Everything needed to understand and replay one failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub run_id: String,
    pub run_index: u64,
    pub seed: u64,
    /// Short failure class (`invariant`, `timeout`, ...).
    pub kind: String,
    pub message: String,
    pub trace: ActionTrace,
    pub last_snapshot: StateSnapshot,
    pub model: Option<Value>,
    pub teardown_error: Option<String>,
}

impl FailureReport {
    pub fn from_failure(seed: u64, run_index: u64, failure: &RunFailure) -> Self {
        Self {
            run_id: run_id(seed, run_index),
            run_index,
            seed,
            kind: failure.kind.label().to_string(),
            message: failure.kind.to_string(),
            trace: failure.trace.clone(),
            last_snapshot: (*failure.last_snapshot).clone(),
            model: failure.model.clone(),
            teardown_error: failure.teardown_error.clone(),
        }
    }

    /// Human-readable summary: failure, trace, last snapshot.
    pub fn render(&self) -> String {
        let mut out = format!(
            "run {} (seed {}, run index {}) failed [{}]\n{}\n\naction trace:\n{}",
            self.run_id,
            self.seed,
            self.run_index,
            self.kind,
            self.message,
            self.trace.render()
        );
        if let Some(teardown) = &self.teardown_error {
            out.push_str(&format!("\nteardown also failed: {teardown}\n"));
        }
        let snapshot = serde_json::to_string_pretty(&self.last_snapshot)
            .unwrap_or_else(|err| format!("<unserializable snapshot: {err}>"));
        out.push_str("\nlast snapshot:\n");
        out.push_str(&snapshot);
        out.push('\n');
        out
    }
}

/// Stable identifier for run `run_index` under `seed`.
pub fn run_id(seed: u64, run_index: u64) -> String {
    format!("seed{seed}-run{run_index}")
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub dir: PathBuf,
    pub report_path: PathBuf,
    pub trace_path: PathBuf,
}

impl ReportPaths {
    pub fn new(artifacts_dir: &Path, run_id: &str) -> Self {
        let dir = artifacts_dir.join(run_id);
        Self {
            report_path: dir.join("failure.json"),
            trace_path: dir.join("trace.log"),
            dir,
        }
    }
}

/// Write `failure.json` and `trace.log` for one failed run.
pub fn write_failure_report(artifacts_dir: &Path, report: &FailureReport) -> Result<ReportPaths> {
    let paths = ReportPaths::new(artifacts_dir, &report.run_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create report dir {}", paths.dir.display()))?;
    let mut json = serde_json::to_string_pretty(report).context("serialize failure report")?;
    json.push('\n');
    write_atomic(&paths.report_path, &json)?;
    write_atomic(&paths.trace_path, &report.render())?;
    info!(path = %paths.report_path.display(), "wrote failure report");
    Ok(paths)
}

pub fn load_failure_report(path: &Path) -> Result<FailureReport> {
    debug!(path = %path.display(), "loading failure report");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read report {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse report {}", path.display()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::trace::{ActionOutcome, ActionRecord};

    fn sample() -> FailureReport {
        let mut trace = ActionTrace::default();
        trace.push(ActionRecord {
            step: 1,
            action: "start_normal_run".to_string(),
            args: vec!["A".to_string()],
            commands: vec!["start A 0".to_string()],
            outcome: ActionOutcome::Completed,
            model_after: Some(json!({"in_session": true})),
        });
        FailureReport {
            run_id: run_id(7, 2),
            run_index: 2,
            seed: 7,
            kind: "invariant".to_string(),
            message: "invariant violated after step 1: session_agreement: model says in_session=true, driven system says in_session=false".to_string(),
            trace,
            last_snapshot: StateSnapshot::parse(r#"{"ready_for_command":true,"in_game":false}"#),
            model: Some(json!({"in_session": true})),
            teardown_error: None,
        }
    }

    #[test]
    fn writes_json_and_trace_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = sample();
        let paths = write_failure_report(temp.path(), &report).expect("write");
        assert_eq!(paths.dir, temp.path().join("seed7-run2"));

        let loaded = load_failure_report(&paths.report_path).expect("load");
        assert_eq!(loaded, report);

        let log = fs::read_to_string(&paths.trace_path).expect("read log");
        assert!(log.contains("session_agreement"), "{log}");
        assert!(log.contains("[start A 0]"), "{log}");
        assert!(log.contains("\"in_session\": false"), "{log}");
    }
}
