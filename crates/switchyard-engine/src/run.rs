//! Run and node-run records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_types::{
    ArtifactId, EdgeId, FlowchartId, NodeId, NodeRunStatus, RunId, RunNodeId, RunStatus,
};

use crate::artifacts::ArtifactPayload;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowchartRun {
    pub id: RunId,
    pub flowchart_id: FlowchartId,
    pub status: RunStatus,
    pub dispatch_id: Option<String>,
    pub graph_version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// First unrecovered failure or budget breach.
    pub error: Option<String>,
    pub executed_nodes: u64,
    pub artifact_history: Vec<ArtifactHistoryEntry>,
}

/// Compact record of an artifact a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHistoryEntry {
    pub artifact_id: ArtifactId,
    pub run_node_id: RunNodeId,
    pub node_id: NodeId,
    pub artifact_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayAction {
    Retry,
    Skip,
    Rewind,
}

impl ReplayAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplayAction::Retry => "retry",
            ReplayAction::Skip => "skip",
            ReplayAction::Rewind => "rewind",
        }
    }
}

/// Tags an execution created by an operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayMarker {
    pub action: ReplayAction,
    pub target_run_node_id: RunNodeId,
}

impl fmt::Display for ReplayMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.action.as_str(), self.target_run_node_id)
    }
}

/// The upstream execution that made a node eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSource {
    pub edge_id: Option<EdgeId>,
    pub source_node_id: NodeId,
    pub source_run_node_id: RunNodeId,
    pub condition_key: Option<String>,
    pub execution_index: u64,
}

/// A read-only input copied from a dotted edge's source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulledDottedSource {
    pub edge_id: EdgeId,
    pub source_node_id: NodeId,
    pub artifact_id: ArtifactId,
    pub payload: ArtifactPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContext {
    pub trigger_sources: Vec<TriggerSource>,
    pub pulled_dotted_sources: Vec<PulledDottedSource>,
    pub replay: Option<ReplayMarker>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_key: Option<String>,
    /// Set when a decision fell back to its configured key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback_applied: bool,
}

impl RoutingState {
    pub fn keyed(route_key: impl Into<String>) -> Self {
        Self {
            route_key: Some(route_key.into()),
            fallback_applied: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowchartRunNode {
    pub id: RunNodeId,
    pub flowchart_run_id: RunId,
    pub flowchart_node_id: NodeId,
    pub execution_index: u64,
    pub status: NodeRunStatus,
    pub input_context: InputContext,
    pub output_state: serde_json::Value,
    pub routing_state: RoutingState,
    pub error: Option<String>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub dispatch_id: Option<String>,
    pub dispatch_uncertain: bool,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowchartRunNode {
    /// Record the dispatch id. A second, different id is refused.
    pub fn assign_dispatch(&mut self, dispatch_id: String) -> bool {
        match &self.dispatch_id {
            Some(existing) => *existing == dispatch_id,
            None => {
                self.dispatch_id = Some(dispatch_id);
                true
            }
        }
    }

    pub fn finish(&mut self, status: NodeRunStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
    }

    pub fn as_trigger(&self, edge_id: Option<EdgeId>, condition_key: Option<String>) -> TriggerSource {
        TriggerSource {
            edge_id,
            source_node_id: self.flowchart_node_id,
            source_run_node_id: self.id,
            condition_key,
            execution_index: self.execution_index,
        }
    }
}

/// A node that has become eligible but has no run-node row yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub node_id: NodeId,
    pub trigger_sources: Vec<TriggerSource>,
    pub replay: Option<ReplayMarker>,
}

impl Activation {
    pub fn new(node_id: NodeId, trigger_sources: Vec<TriggerSource>) -> Self {
        Self {
            node_id,
            trigger_sources,
            replay: None,
        }
    }
}

pub fn node_idempotency_key(
    run_id: RunId,
    node_id: NodeId,
    execution_index: u64,
    replay: Option<&ReplayMarker>,
) -> String {
    match replay {
        Some(marker) => format!("run-{run_id}:node-{node_id}:exec-{execution_index}:{marker}"),
        None => format!("run-{run_id}:node-{node_id}:exec-{execution_index}"),
    }
}

pub fn run_idempotency_key(run_id: RunId) -> String {
    format!("run-{run_id}")
}
