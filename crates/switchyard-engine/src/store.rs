//! In-process persistent store and snapshot save/restore.
//!
//! Every state change goes through [`FlowchartStore::transaction`], which
//! holds a single mutex for the duration of the closure and commits only when
//! the closure succeeds. Snapshots serialize
//! the whole store, plus the artifact store, to `<dir>/switchyard.json` so a
//! restarted engine can pick up where it left off via
//! [`crate::RunCoordinator::recover`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_types::{
    EdgeId, FlowchartId, NodeId, NodeRunStatus, Result, RunId, RunNodeId, SwitchyardError,
};

use crate::artifacts::{ArtifactStore, NodeArtifact};
use crate::graph::FlowchartGraph;
use crate::routing::FanInWave;
use crate::run::{Activation, FlowchartRun, FlowchartRunNode};

const SNAPSHOT_FILE: &str = "switchyard.json";

/// Per-flowchart run budgets. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBudgets {
    #[serde(default)]
    pub max_node_executions: Option<u64>,
    #[serde(default)]
    pub max_runtime_minutes: Option<u64>,
    #[serde(default)]
    pub max_parallel_nodes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flowchart {
    pub id: FlowchartId,
    pub name: String,
    pub budgets: RunBudgets,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A run plus everything the coordinator tracks while driving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: FlowchartRun,
    /// The graph snapshot the run was started against.
    pub graph: FlowchartGraph,
    pub budgets: RunBudgets,
    pub nodes: BTreeMap<RunNodeId, FlowchartRunNode>,
    pub pending: VecDeque<Activation>,
    pub fan_in: BTreeMap<NodeId, FanInWave>,
    /// Failed node runs no operator action has dealt with yet.
    pub unrecovered: BTreeSet<RunNodeId>,
    pub next_execution_index: u64,
}

impl RunRecord {
    pub fn in_flight(&self) -> impl Iterator<Item = &FlowchartRunNode> {
        self.nodes.values().filter(|n| n.status.is_in_flight())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight().count()
    }

    /// Allocate the next execution index. Indices are gap-free from 0.
    pub fn allocate_index(&mut self) -> u64 {
        let index = self.next_execution_index;
        self.next_execution_index += 1;
        index
    }

    pub fn node_runs(&self) -> Vec<FlowchartRunNode> {
        let mut runs: Vec<_> = self.nodes.values().cloned().collect();
        runs.sort_by_key(|n| n.execution_index);
        runs
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct IdCounters {
    flowchart: FlowchartId,
    node: NodeId,
    edge: EdgeId,
    run: RunId,
    run_node: RunNodeId,
}

/// The store's contents. Only reachable inside a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreInner {
    flowcharts: BTreeMap<FlowchartId, Flowchart>,
    graphs: BTreeMap<FlowchartId, FlowchartGraph>,
    runs: BTreeMap<RunId, RunRecord>,
    run_node_owner: HashMap<RunNodeId, RunId>,
    ids: IdCounters,
}

impl StoreInner {
    // === Flowcharts ===

    pub fn create_flowchart(
        &mut self,
        name: String,
        budgets: RunBudgets,
        now: DateTime<Utc>,
    ) -> Flowchart {
        self.ids.flowchart += 1;
        let flowchart = Flowchart {
            id: self.ids.flowchart,
            name,
            budgets,
            created_at: now,
            updated_at: now,
        };
        self.graphs
            .insert(flowchart.id, FlowchartGraph::empty(flowchart.id));
        self.flowcharts.insert(flowchart.id, flowchart.clone());
        flowchart
    }

    pub fn flowchart(&self, id: FlowchartId) -> Result<&Flowchart> {
        self.flowcharts.get(&id).ok_or(SwitchyardError::NotFound {
            entity: "flowchart",
            id,
        })
    }

    pub fn flowchart_mut(&mut self, id: FlowchartId) -> Result<&mut Flowchart> {
        self.flowcharts.get_mut(&id).ok_or(SwitchyardError::NotFound {
            entity: "flowchart",
            id,
        })
    }

    pub fn flowchart_ids(&self) -> impl Iterator<Item = FlowchartId> + '_ {
        self.flowcharts.keys().copied()
    }

    // === Graphs ===

    pub fn graph(&self, flowchart_id: FlowchartId) -> Result<&FlowchartGraph> {
        self.graphs.get(&flowchart_id).ok_or(SwitchyardError::NotFound {
            entity: "flowchart",
            id: flowchart_id,
        })
    }

    pub fn put_graph(&mut self, graph: FlowchartGraph) {
        self.graphs.insert(graph.flowchart_id, graph);
    }

    pub fn allocate_node_id(&mut self) -> NodeId {
        self.ids.node += 1;
        self.ids.node
    }

    pub fn allocate_edge_id(&mut self) -> EdgeId {
        self.ids.edge += 1;
        self.ids.edge
    }

    // === Runs ===

    pub fn insert_run(&mut self, record: RunRecord) -> RunId {
        let id = record.run.id;
        self.runs.insert(id, record);
        id
    }

    pub fn allocate_run_id(&mut self) -> RunId {
        self.ids.run += 1;
        self.ids.run
    }

    pub fn run(&self, id: RunId) -> Result<&RunRecord> {
        self.runs.get(&id).ok_or(SwitchyardError::NotFound {
            entity: "flowchart run",
            id,
        })
    }

    pub fn run_mut(&mut self, id: RunId) -> Result<&mut RunRecord> {
        self.runs.get_mut(&id).ok_or(SwitchyardError::NotFound {
            entity: "flowchart run",
            id,
        })
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.keys().copied().collect()
    }

    pub fn runs(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.values()
    }

    // === Run nodes ===

    pub fn allocate_run_node_id(&mut self, run_id: RunId) -> RunNodeId {
        self.ids.run_node += 1;
        self.run_node_owner.insert(self.ids.run_node, run_id);
        self.ids.run_node
    }

    pub fn run_node(&self, id: RunNodeId) -> Result<&FlowchartRunNode> {
        self.run_node_owner
            .get(&id)
            .and_then(|run_id| self.runs.get(run_id))
            .and_then(|record| record.nodes.get(&id))
            .ok_or(SwitchyardError::NotFound {
                entity: "flowchart run node",
                id,
            })
    }

    pub fn node_runs(&self, filter: &NodeRunFilter) -> Vec<FlowchartRunNode> {
        let mut out: Vec<_> = self
            .runs
            .values()
            .filter(|r| filter.flowchart_run_id.map_or(true, |id| id == r.run.id))
            .filter(|r| filter.flowchart_id.map_or(true, |id| id == r.run.flowchart_id))
            .flat_map(|r| r.nodes.values())
            .filter(|n| filter.flowchart_node_id.map_or(true, |id| id == n.flowchart_node_id))
            .filter(|n| filter.status.map_or(true, |s| s == n.status))
            .cloned()
            .collect();
        out.sort_by_key(|n| (n.flowchart_run_id, n.execution_index));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRunFilter {
    #[serde(default)]
    pub flowchart_id: Option<FlowchartId>,
    #[serde(default)]
    pub flowchart_run_id: Option<RunId>,
    #[serde(default)]
    pub flowchart_node_id: Option<NodeId>,
    #[serde(default)]
    pub status: Option<NodeRunStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// FlowchartStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FlowchartStore {
    inner: Mutex<StoreInner>,
}

impl FlowchartStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner.lock().map_err(|_| SwitchyardError::LockPoisoned)
    }

    /// Run `f` with exclusive access to the store.
    ///
    /// `f` works on a copy that replaces the stored state only when it
    /// returns `Ok`; on `Err` nothing it did is kept, id counters included.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut StoreInner) -> Result<R>) -> Result<R> {
        let mut inner = self.lock()?;
        let mut working = inner.clone();
        let value = f(&mut working)?;
        *inner = working;
        Ok(value)
    }

    /// Read-only access; same lock as [`transaction`](Self::transaction).
    pub fn read<R>(&self, f: impl FnOnce(&StoreInner) -> Result<R>) -> Result<R> {
        let inner = self.lock()?;
        f(&inner)
    }
}

#[derive(Serialize, Deserialize)]
struct EngineSnapshot {
    saved_at: DateTime<Utc>,
    store: StoreInner,
    artifacts: Vec<NodeArtifact>,
}

/// Save the store and artifacts to `<dir>/switchyard.json`.
///
/// The directory is created if it does not already exist.
pub async fn save_snapshot(
    store: &FlowchartStore,
    artifacts: &ArtifactStore,
    dir: &Path,
) -> Result<PathBuf> {
    let json = {
        let inner = store.lock()?;
        let snapshot = SnapshotRef {
            saved_at: Utc::now(),
            store: &*inner,
            artifacts: artifacts.export()?,
        };
        serde_json::to_string_pretty(&snapshot)?
    };
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(SNAPSHOT_FILE);
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), "Snapshot saved");
    Ok(path)
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    saved_at: DateTime<Utc>,
    store: &'a StoreInner,
    artifacts: Vec<NodeArtifact>,
}

/// Load a snapshot written by [`save_snapshot`].
///
/// Returns `Ok(None)` when no snapshot exists.
pub async fn load_snapshot(dir: &Path) -> Result<Option<(FlowchartStore, ArtifactStore)>> {
    let path = dir.join(SNAPSHOT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    let snapshot: EngineSnapshot = serde_json::from_str(&json)?;
    tracing::info!(
        path = %path.display(),
        saved_at = %snapshot.saved_at,
        runs = snapshot.store.runs.len(),
        "Snapshot loaded"
    );

    let artifacts = ArtifactStore::new();
    artifacts.import(snapshot.artifacts)?;
    let store = FlowchartStore {
        inner: Mutex::new(snapshot.store),
    };
    Ok(Some((store, artifacts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactPayload, NewArtifact, RetentionPolicy};
    use crate::graph::test_support::*;
    use crate::graph::NodeType;
    use crate::run::{node_idempotency_key, InputContext, RoutingState};
    use serde_json::json;
    use switchyard_types::RunStatus;

    fn sample_store() -> FlowchartStore {
        let store = FlowchartStore::new();
        store
            .transaction(|tx| {
                let now = Utc::now();
                let fc = tx.create_flowchart("demo".into(), RunBudgets::default(), now);
                let graph = FlowchartGraph::new(
                    fc.id,
                    1,
                    vec![
                        node(1, NodeType::Start, json!({})),
                        node(2, NodeType::Task, json!({"prompt": "x"})),
                    ],
                    vec![edge(1, 1, 2)],
                );
                tx.put_graph(graph.clone());

                let run_id = tx.allocate_run_id();
                let run_node_id = tx.allocate_run_node_id(run_id);
                let mut record = RunRecord {
                    run: FlowchartRun {
                        id: run_id,
                        flowchart_id: fc.id,
                        status: RunStatus::Running,
                        dispatch_id: Some("d-1".into()),
                        graph_version: 1,
                        created_at: now,
                        started_at: Some(now),
                        finished_at: None,
                        error: None,
                        executed_nodes: 1,
                        artifact_history: vec![],
                    },
                    graph,
                    budgets: RunBudgets::default(),
                    nodes: BTreeMap::new(),
                    pending: VecDeque::from([Activation::new(2, vec![])]),
                    fan_in: BTreeMap::new(),
                    unrecovered: BTreeSet::new(),
                    next_execution_index: 0,
                };
                let index = record.allocate_index();
                record.nodes.insert(
                    run_node_id,
                    FlowchartRunNode {
                        id: run_node_id,
                        flowchart_run_id: run_id,
                        flowchart_node_id: 1,
                        execution_index: index,
                        status: NodeRunStatus::Completed,
                        input_context: InputContext::default(),
                        output_state: json!({}),
                        routing_state: RoutingState::default(),
                        error: None,
                        degraded: false,
                        degraded_reason: None,
                        dispatch_id: None,
                        dispatch_uncertain: false,
                        idempotency_key: node_idempotency_key(run_id, 1, index, None),
                        created_at: now,
                        started_at: Some(now),
                        finished_at: Some(now),
                    },
                );
                tx.insert_run(record);
                Ok(())
            })
            .unwrap();
        store
    }

    #[test]
    fn not_found_errors_name_the_entity() {
        let store = FlowchartStore::new();
        let err = store.read(|tx| tx.run(99).map(|_| ())).unwrap_err();
        assert_eq!(err.to_string(), "flowchart run 99 not found");
        let err = store.read(|tx| tx.flowchart(3).map(|_| ())).unwrap_err();
        assert_eq!(err.to_string(), "flowchart 3 not found");
    }

    #[test]
    fn node_run_filter_and_lookup() {
        let store = sample_store();
        store
            .read(|tx| {
                let node = tx.run_node(1)?;
                assert_eq!(node.flowchart_node_id, 1);
                let filter = NodeRunFilter {
                    status: Some(NodeRunStatus::Failed),
                    ..Default::default()
                };
                assert!(tx.node_runs(&filter).is_empty());
                assert_eq!(tx.node_runs(&NodeRunFilter::default()).len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_transaction_keeps_nothing() {
        let store = sample_store();
        let err = store
            .transaction(|tx| {
                tx.allocate_node_id();
                tx.allocate_edge_id();
                let run_id = tx.allocate_run_id();
                tx.allocate_run_node_id(run_id);
                let record = tx.run_mut(1)?;
                record.run.status = RunStatus::Failed;
                record.pending.clear();
                tx.flowchart_mut(1)?.name = "renamed".into();
                Err::<(), _>(SwitchyardError::Conflict("late check".into()))
            })
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Conflict(_)));

        store
            .read(|tx| {
                let record = tx.run(1)?;
                assert_eq!(record.run.status, RunStatus::Running);
                assert_eq!(record.pending.len(), 1);
                assert_eq!(tx.flowchart(1)?.name, "demo");
                assert_eq!(tx.run_ids(), vec![1]);
                Ok(())
            })
            .unwrap();

        // Counters pick up where the last committed transaction left them.
        let ids = store
            .transaction(|tx| {
                let run_id = tx.allocate_run_id();
                Ok((tx.allocate_node_id(), run_id, tx.allocate_run_node_id(run_id)))
            })
            .unwrap();
        assert_eq!(ids, (1, 2, 2));
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = sample_store();
        let artifacts = ArtifactStore::new();
        artifacts
            .store(
                NewArtifact {
                    flowchart_id: 1,
                    flowchart_node_id: 1,
                    flowchart_run_id: 1,
                    flowchart_run_node_id: 1,
                    artifact_type: "output".into(),
                    ref_id: None,
                    payload: ArtifactPayload::new(json!("hello")),
                    retention: RetentionPolicy::Forever,
                    idempotency_key: "output".into(),
                },
                Utc::now(),
            )
            .unwrap();

        let path = save_snapshot(&store, &artifacts, dir.path()).await.unwrap();
        assert!(path.exists());

        let (restored, restored_artifacts) = load_snapshot(dir.path()).await.unwrap().unwrap();
        restored
            .read(|tx| {
                let record = tx.run(1)?;
                assert_eq!(record.run.status, RunStatus::Running);
                assert_eq!(record.pending.len(), 1);
                assert_eq!(record.next_execution_index, 1);
                assert_eq!(record.graph.node(2).unwrap().config.task_prompt(), Some("x"));
                assert_eq!(tx.run_node(1)?.execution_index, 0);
                Ok(())
            })
            .unwrap();
        assert_eq!(restored_artifacts.export().unwrap().len(), 1);

        // Counters survive, so new ids never collide with restored ones.
        let next = restored
            .transaction(|tx| Ok(tx.allocate_run_node_id(1)))
            .unwrap();
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn load_from_missing_directory_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does_not_exist");
        assert!(load_snapshot(&missing).await.unwrap().is_none());
    }
}
