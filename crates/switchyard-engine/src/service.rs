//! The engine's public facade: graph editing, run control, and queries.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard_types::{
    Diagnostic, EdgeId, FlowchartId, NodeId, Result, RunId, RunStatus, SwitchyardError,
};
use tokio::task::JoinHandle;

use crate::artifacts::{spawn_retention_sweeper, ArtifactFilter, ArtifactStore, NodeArtifact};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::control::{ControlAction, ControlOutcome};
use crate::coordinator::{CoordinatorParts, RunCoordinator};
use crate::dispatcher::NodeExecutor;
use crate::events::{EventEmitter, RunEvent};
use crate::graph::{EdgeDraft, EdgeMode, FlowchartEdge, FlowchartGraph, FlowchartNode, NodeDraft, NodeRef, NodeType};
use crate::node_config::NodeConfig;
use crate::references::{ensure_refs, AllowAllReferences, EnsureRef, ReferenceChecker};
use crate::run::{FlowchartRun, FlowchartRunNode};
use crate::store::{load_snapshot, save_snapshot, Flowchart, FlowchartStore, NodeRunFilter, RunBudgets};
use crate::validation::{validate, validate_graph};

/// A graph plus, when asked for, its validation findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphReport {
    pub graph: FlowchartGraph,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Vec<Diagnostic>>,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.validation.as_ref().map_or(true, |v| v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: FlowchartRun,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_runs: Option<Vec<FlowchartRunNode>>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ServiceBuilder {
    executor: Arc<dyn NodeExecutor>,
    references: Arc<dyn ReferenceChecker>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    store: FlowchartStore,
    artifacts: ArtifactStore,
    sweeper: bool,
}

impl ServiceBuilder {
    pub fn references(mut self, references: Arc<dyn ReferenceChecker>) -> Self {
        self.references = references;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the artifact retention sweeper in the background.
    pub fn retention_sweeper(mut self, enabled: bool) -> Self {
        self.sweeper = enabled;
        self
    }

    /// Start from a snapshot in `dir`, if one exists. Call
    /// [`FlowchartService::recover`] after building to resume its runs.
    pub async fn restore_from(mut self, dir: &Path) -> Result<Self> {
        if let Some((store, artifacts)) = load_snapshot(dir).await? {
            self.store = store;
            self.artifacts = artifacts;
        }
        Ok(self)
    }

    /// Wire everything up. Must be called inside a tokio runtime.
    pub fn build(self) -> FlowchartService {
        let events = EventEmitter::new(self.config.event_capacity);
        let artifacts = Arc::new(self.artifacts);
        let sweeper = self.sweeper.then(|| {
            spawn_retention_sweeper(
                artifacts.clone(),
                self.clock.clone(),
                self.config.retention_sweep_interval,
                events.clone(),
            )
        });
        let coordinator = RunCoordinator::start(CoordinatorParts {
            store: Arc::new(self.store),
            artifacts,
            executor: self.executor,
            references: self.references,
            events,
            clock: self.clock.clone(),
            config: self.config,
        });
        FlowchartService {
            coordinator,
            clock: self.clock,
            sweeper,
        }
    }
}

// ---------------------------------------------------------------------------
// FlowchartService
// ---------------------------------------------------------------------------

pub struct FlowchartService {
    coordinator: Arc<RunCoordinator>,
    clock: Arc<dyn Clock>,
    sweeper: Option<JoinHandle<()>>,
}

impl FlowchartService {
    pub fn builder(executor: Arc<dyn NodeExecutor>) -> ServiceBuilder {
        ServiceBuilder {
            executor,
            references: Arc::new(AllowAllReferences),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            store: FlowchartStore::new(),
            artifacts: ArtifactStore::new(),
            sweeper: false,
        }
    }

    fn store(&self) -> &FlowchartStore {
        self.coordinator.store()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.coordinator.events().subscribe()
    }

    // === Flowcharts ===

    pub fn create_flowchart(&self, name: &str, budgets: RunBudgets) -> Result<Flowchart> {
        let flowchart = self
            .store()
            .transaction(|tx| Ok(tx.create_flowchart(name.to_string(), budgets, self.clock.now())))?;
        tracing::info!(flowchart_id = flowchart.id, name, "Flowchart created");
        Ok(flowchart)
    }

    pub fn get_flowchart(&self, flowchart_id: FlowchartId) -> Result<Flowchart> {
        self.store().read(|tx| tx.flowchart(flowchart_id).cloned())
    }

    /// Change budgets for runs started from now on.
    pub fn set_budgets(&self, flowchart_id: FlowchartId, budgets: RunBudgets) -> Result<Flowchart> {
        self.store().transaction(|tx| {
            let now = self.clock.now();
            let flowchart = tx.flowchart_mut(flowchart_id)?;
            flowchart.budgets = budgets;
            flowchart.updated_at = now;
            Ok(flowchart.clone())
        })
    }

    // === Graphs ===

    /// Replace the flowchart's whole node and edge set.
    ///
    /// Drafts with an `id` keep it and must already belong to this
    /// flowchart; the rest get fresh ids, and edges may point at them by
    /// `client_key`. The replacement is all or nothing: if validation finds
    /// anything, nothing is written and the report carries the graph that is
    /// still stored together with the findings.
    pub fn replace_graph(
        &self,
        flowchart_id: FlowchartId,
        nodes: Vec<NodeDraft>,
        edges: Vec<EdgeDraft>,
    ) -> Result<GraphReport> {
        let diagnostics = validate(&nodes, &edges);
        if !diagnostics.is_empty() {
            let current = self.store().read(|tx| tx.graph(flowchart_id).cloned())?;
            tracing::warn!(
                flowchart_id,
                version = current.version,
                findings = diagnostics.len(),
                "Graph replacement rejected"
            );
            return Ok(GraphReport {
                graph: current,
                validation: Some(diagnostics),
            });
        }

        let graph = self.store().transaction(|tx| {
            let (version, known_nodes, known_edges) = {
                let current = tx.graph(flowchart_id)?;
                (
                    current.version,
                    current.all_nodes().map(|n| n.id).collect::<HashSet<NodeId>>(),
                    current.all_edges().iter().map(|e| e.id).collect::<HashSet<EdgeId>>(),
                )
            };
            let foreign = |kind: &str, id: i64| {
                SwitchyardError::Conflict(format!(
                    "{kind} {id} does not belong to flowchart {flowchart_id}"
                ))
            };

            if let Some(id) = nodes.iter().filter_map(|n| n.id).find(|id| !known_nodes.contains(id)) {
                return Err(foreign("node", id));
            }
            if let Some(id) = edges.iter().filter_map(|e| e.id).find(|id| !known_edges.contains(id)) {
                return Err(foreign("edge", id));
            }

            let mut ids: HashMap<NodeRef, NodeId> = HashMap::new();
            let mut built_nodes = Vec::with_capacity(nodes.len());
            for draft in nodes {
                let id = match draft.id {
                    Some(id) if known_nodes.contains(&id) => id,
                    Some(id) => return Err(foreign("node", id)),
                    None => tx.allocate_node_id(),
                };
                ids.insert(NodeRef::Id(id), id);
                if let Some(key) = &draft.client_key {
                    ids.insert(NodeRef::Key(key.clone()), id);
                }
                let node_type: NodeType = draft
                    .node_type
                    .parse()
                    .map_err(|e: String| SwitchyardError::Other(e))?;
                let config = NodeConfig::parse(node_type, &draft.config)
                    .map_err(|errors| SwitchyardError::Other(errors.join("; ")))?;
                built_nodes.push(FlowchartNode {
                    id,
                    flowchart_id,
                    node_type,
                    title: draft.title,
                    ref_id: draft.ref_id,
                    x: draft.x,
                    y: draft.y,
                    config,
                    bindings: draft.bindings,
                });
            }

            let mut built_edges = Vec::with_capacity(edges.len());
            for draft in edges {
                let id = match draft.id {
                    Some(id) if known_edges.contains(&id) => id,
                    Some(id) => return Err(foreign("edge", id)),
                    None => tx.allocate_edge_id(),
                };
                let resolve = |r: &NodeRef| {
                    ids.get(r).copied().ok_or_else(|| {
                        SwitchyardError::Other(format!("edge {id} points at unknown node {r}"))
                    })
                };
                let edge_mode: EdgeMode = draft
                    .edge_mode
                    .parse()
                    .map_err(|e: String| SwitchyardError::Other(e))?;
                built_edges.push(FlowchartEdge {
                    id,
                    flowchart_id,
                    source_node_id: resolve(&draft.source)?,
                    target_node_id: resolve(&draft.target)?,
                    edge_mode,
                    condition_key: draft.condition_key,
                    label: draft.label,
                });
            }

            let graph = FlowchartGraph::new(flowchart_id, version + 1, built_nodes, built_edges);
            tx.put_graph(graph.clone());
            tx.flowchart_mut(flowchart_id)?.updated_at = self.clock.now();
            Ok(graph)
        })?;

        tracing::info!(flowchart_id, version = graph.version, "Graph replaced");
        Ok(GraphReport {
            graph,
            validation: Some(diagnostics),
        })
    }

    /// [`replace_graph`](Self::replace_graph) after letting `strategy`
    /// provision references the drafts are missing.
    pub async fn replace_graph_with(
        &self,
        flowchart_id: FlowchartId,
        mut nodes: Vec<NodeDraft>,
        edges: Vec<EdgeDraft>,
        strategy: &dyn EnsureRef,
    ) -> Result<GraphReport> {
        self.get_flowchart(flowchart_id)?;
        ensure_refs(flowchart_id, &mut nodes, strategy).await?;
        self.replace_graph(flowchart_id, nodes, edges)
    }

    pub fn get_graph(&self, flowchart_id: FlowchartId, include_validation: bool) -> Result<GraphReport> {
        let graph = self.store().read(|tx| tx.graph(flowchart_id).cloned())?;
        let validation = include_validation.then(|| validate_graph(&graph));
        Ok(GraphReport { graph, validation })
    }

    // === Runs ===

    pub async fn start_run(&self, flowchart_id: FlowchartId) -> Result<FlowchartRun> {
        self.coordinator.start_run(flowchart_id).await
    }

    pub fn control_run(&self, run_id: RunId, action: ControlAction) -> Result<ControlOutcome> {
        self.coordinator.control_run(run_id, action)
    }

    pub fn get_run(&self, run_id: RunId, include_node_runs: bool) -> Result<RunReport> {
        self.store().read(|tx| {
            let record = tx.run(run_id)?;
            Ok(RunReport {
                run: record.run.clone(),
                node_runs: include_node_runs.then(|| record.node_runs()),
            })
        })
    }

    pub fn list_runs(&self, flowchart_id: Option<FlowchartId>) -> Result<Vec<FlowchartRun>> {
        self.store().read(|tx| {
            Ok(tx
                .runs()
                .filter(|r| flowchart_id.map_or(true, |id| r.run.flowchart_id == id))
                .map(|r| r.run.clone())
                .collect())
        })
    }

    pub fn list_node_runs(&self, filter: &NodeRunFilter) -> Result<Vec<FlowchartRunNode>> {
        self.store().read(|tx| Ok(tx.node_runs(filter)))
    }

    pub fn list_artifacts(&self, filter: &ArtifactFilter) -> Result<Vec<NodeArtifact>> {
        self.coordinator.artifacts().list(filter, self.clock.now())
    }

    /// Delete artifacts past their retention now, without waiting for the
    /// sweeper.
    pub fn prune_artifacts(&self) -> Result<usize> {
        self.coordinator.artifacts().prune(self.clock.now())
    }

    /// Wait for the run to reach a terminal status. On timeout the run is
    /// returned as last seen.
    pub async fn wait_for_run(&self, run_id: RunId, timeout: Duration) -> Result<FlowchartRun> {
        self.coordinator
            .wait_for_status(run_id, RunStatus::is_terminal, timeout)
            .await
    }

    pub async fn wait_for_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        timeout: Duration,
    ) -> Result<FlowchartRun> {
        self.coordinator
            .wait_for_status(run_id, |s| s == status || s.is_terminal(), timeout)
            .await
    }

    // === Persistence ===

    pub async fn save_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        save_snapshot(self.store(), self.coordinator.artifacts(), dir).await
    }

    /// Resume runs loaded from a snapshot.
    pub fn recover(&self) -> Result<usize> {
        self.coordinator.recover()
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
    }
}

impl Drop for FlowchartService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
