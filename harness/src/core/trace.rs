//! Ordered, append-only record of executed actions.
//!
//! The trace exists for failure diagnostics and replay: every entry keeps the
//! action name and arguments exactly as they were executed, together with the
//! wire commands they produced.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How an executed action ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Completed,
    Failed { reason: String },
}

/// One executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// 1-indexed position within the run.
    pub step: u32,
    pub action: String,
    pub args: Vec<String>,
    /// Wire lines sent while the action executed, in order.
    pub commands: Vec<String>,
    pub outcome: ActionOutcome,
    /// Model after the action; absent when the action failed.
    pub model_after: Option<Value>,
}

impl ActionRecord {
    pub fn replay_step(&self) -> ReplayStep {
        ReplayStep {
            action: self.action.clone(),
            args: self.args.clone(),
        }
    }
}

impl fmt::Display for ActionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}({}) -> [{}]",
            self.step,
            self.action,
            self.args.join(", "),
            self.commands.join(" | ")
        )?;
        match &self.outcome {
            ActionOutcome::Completed => f.write_str(" completed"),
            ActionOutcome::Failed { reason } => write!(f, " failed: {reason}"),
        }
    }
}

/// Action name plus arguments: everything needed to re-execute a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub action: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionTrace {
    entries: Vec<ActionRecord>,
}

impl ActionTrace {
    pub fn push(&mut self, record: ActionRecord) {
        self.entries.push(record);
    }

    pub fn entries(&self) -> &[ActionRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn replay_steps(&self) -> Vec<ReplayStep> {
        self.entries.iter().map(ActionRecord::replay_step).collect()
    }

    /// Human-readable rendering, one entry per line.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "(no actions executed)\n".to_string();
        }
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u32, action: &str, outcome: ActionOutcome) -> ActionRecord {
        ActionRecord {
            step,
            action: action.to_string(),
            args: vec!["IRONCLAD".to_string()],
            commands: vec![format!("{action} IRONCLAD 0")],
            outcome,
            model_after: None,
        }
    }

    #[test]
    fn render_lists_entries_in_order() {
        let mut trace = ActionTrace::default();
        trace.push(record(1, "start", ActionOutcome::Completed));
        trace.push(record(
            2,
            "abandon",
            ActionOutcome::Failed {
                reason: "timeout".to_string(),
            },
        ));

        let rendered = trace.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "#1 start(IRONCLAD) -> [start IRONCLAD 0] completed");
        assert!(lines[1].ends_with("failed: timeout"));
    }

    #[test]
    fn empty_trace_renders_a_placeholder() {
        let trace = ActionTrace::default();
        assert!(trace.is_empty());
        assert_eq!(trace.render(), "(no actions executed)\n");
    }

    #[test]
    fn replay_steps_keep_names_and_args() {
        let mut trace = ActionTrace::default();
        trace.push(record(1, "start", ActionOutcome::Completed));
        assert_eq!(
            trace.replay_steps(),
            vec![ReplayStep {
                action: "start".to_string(),
                args: vec!["IRONCLAD".to_string()],
            }]
        );
    }
}
