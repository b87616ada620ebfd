//! Shared types, errors, and statuses for the Switchyard flowchart engine.
//!
//! This crate provides the foundational types used across the other Switchyard crates:
//! - `SwitchyardError`: unified error taxonomy
//! - `Diagnostic`: one itemized graph validation finding
//! - `RunStatus` / `NodeRunStatus`: run and node-run state machines
//! - id aliases for the persisted entities

use std::fmt;

use serde::{Deserialize, Serialize};

pub type FlowchartId = i64;
pub type NodeId = i64;
pub type EdgeId = i64;
pub type RunId = i64;
pub type RunNodeId = i64;
pub type ArtifactId = i64;

// ---------------------------------------------------------------------------
// Diagnostic: one validation finding
// ---------------------------------------------------------------------------

/// A single rule violation reported by the graph validator.
///
/// `node_id` and `edge` carry the identity the caller used for the offending
/// node or edge: a persisted id rendered as a string, or the client key of a
/// node that has not been saved yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule: String,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
}

impl Diagnostic {
    pub fn node(rule: &str, node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            node_id: Some(node_id.into()),
            edge: None,
        }
    }

    pub fn edge(
        rule: &str,
        source: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            node_id: None,
            edge: Some((source.into(), target.into())),
        }
    }

    pub fn graph(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// SwitchyardError
// ---------------------------------------------------------------------------

/// Unified error type for all Switchyard subsystems.
#[derive(Debug, thiserror::Error)]
pub enum SwitchyardError {
    // === Graph Errors ===
    #[error("Flowchart validation failed: {}", summarize(.0))]
    Validation(Vec<Diagnostic>),

    #[error("Reference check failed: {0}")]
    Reference(String),

    // === Execution Errors ===
    #[error("Dispatch of {target} failed: {message}")]
    Dispatch { target: String, message: String },

    #[error("Node '{node}' execution failed: {message}")]
    Execution { node: String, message: String },

    #[error("Run {run_id} exceeded its {budget} budget")]
    BudgetExceeded { run_id: RunId, budget: String },

    #[error("{target} was cancelled")]
    Cancelled { target: String },

    // === Run Control Errors ===
    #[error("Cannot {action} run {run_id} while it is {status}")]
    InvalidTransition {
        run_id: RunId,
        action: String,
        status: RunStatus,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Conflict: {0}")]
    Conflict(String),

    // === Storage ===
    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SwitchyardError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwitchyardError::Dispatch { .. } | SwitchyardError::Conflict(_)
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwitchyardError::Validation(_)
                | SwitchyardError::BudgetExceeded { .. }
                | SwitchyardError::InvalidTransition { .. }
                | SwitchyardError::NotFound { .. }
        )
    }

    /// The validation diagnostics carried by this error, if any.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            SwitchyardError::Validation(diags) => diags,
            _ => &[],
        }
    }
}

/// A convenience alias for `Result<T, SwitchyardError>`.
pub type Result<T> = std::result::Result<T, SwitchyardError>;

// ---------------------------------------------------------------------------
// RunStatus: flowchart run state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Stopping,
    Pausing,
    Paused,
    Completed,
    Failed,
    Canceled,
    Stopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Pausing => "pausing",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Stopped => "stopped",
        }
    }

    /// Terminal runs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled | RunStatus::Stopped
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether new node dispatches may be issued in this status.
    pub fn accepts_dispatch(self) -> bool {
        self == RunStatus::Running
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// NodeRunStatus: per-execution state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Skipped,
}

impl NodeRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRunStatus::Queued => "queued",
            NodeRunStatus::Running => "running",
            NodeRunStatus::Completed => "completed",
            NodeRunStatus::Failed => "failed",
            NodeRunStatus::Canceled => "canceled",
            NodeRunStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, NodeRunStatus::Queued | NodeRunStatus::Running)
    }
}

impl fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_validation_joins_messages() {
        let err = SwitchyardError::Validation(vec![
            Diagnostic::graph("start_node", "expected exactly one start node, found 0"),
            Diagnostic::node("task_prompt", "7", "task node '7' requires a non-empty prompt"),
        ]);
        assert_eq!(
            err.to_string(),
            "Flowchart validation failed: expected exactly one start node, found 0; \
             task node '7' requires a non-empty prompt"
        );
        assert_eq!(err.diagnostics().len(), 2);
    }

    #[test]
    fn error_display_invalid_transition() {
        let err = SwitchyardError::InvalidTransition {
            run_id: 4,
            action: "pause".into(),
            status: RunStatus::Completed,
        };
        assert_eq!(err.to_string(), "Cannot pause run 4 while it is completed");
    }

    #[test]
    fn error_display_budget_exceeded() {
        let err = SwitchyardError::BudgetExceeded {
            run_id: 9,
            budget: "max_node_executions".into(),
        };
        assert_eq!(err.to_string(), "Run 9 exceeded its max_node_executions budget");
    }

    #[test]
    fn error_display_not_found() {
        let err = SwitchyardError::NotFound {
            entity: "flowchart run",
            id: 12,
        };
        assert_eq!(err.to_string(), "flowchart run 12 not found");
    }

    #[test]
    fn retryable_and_terminal_classification() {
        let dispatch = SwitchyardError::Dispatch {
            target: "run node 3".into(),
            message: "executor unavailable".into(),
        };
        assert!(dispatch.is_retryable());
        assert!(!dispatch.is_terminal());

        let validation = SwitchyardError::Validation(vec![]);
        assert!(validation.is_terminal());
        assert!(!validation.is_retryable());

        let other = SwitchyardError::Other("boom".into());
        assert!(!other.is_retryable());
        assert!(!other.is_terminal());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SwitchyardError = io.into();
        assert!(matches!(err, SwitchyardError::Io(_)));
        assert!(err.to_string().starts_with("IO error"));
    }

    #[test]
    fn run_status_terminal_and_active() {
        for status in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Canceled,
            RunStatus::Stopped,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
            assert!(!status.is_active());
        }
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Stopping,
            RunStatus::Pausing,
            RunStatus::Paused,
        ] {
            assert!(status.is_active(), "{status} should be active");
        }
        assert!(RunStatus::Running.accepts_dispatch());
        assert!(!RunStatus::Paused.accepts_dispatch());
    }

    #[test]
    fn node_run_status_in_flight() {
        assert!(NodeRunStatus::Queued.is_in_flight());
        assert!(NodeRunStatus::Running.is_in_flight());
        assert!(NodeRunStatus::Skipped.is_terminal());
        assert!(NodeRunStatus::Canceled.is_terminal());
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Pausing).unwrap(),
            "\"pausing\""
        );
        let parsed: NodeRunStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(parsed, NodeRunStatus::Skipped);
    }
}
