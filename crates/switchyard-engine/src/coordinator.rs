//! Run coordinator: drives runs from `queued` to a terminal status.
//!
//! The coordinator reacts to [`CoordinatorSignal`]s from the dispatcher and a
//! periodic budget tick. Each reaction is one store transaction that records
//! the result, routes to the next eligible nodes, dispatches what the run's
//! status and budgets allow, and finally checks whether the run is done.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use switchyard_types::{
    FlowchartId, NodeRunStatus, Result, RunId, RunNodeId, RunStatus, SwitchyardError,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::artifacts::{ArtifactPayload, ArtifactStore, NewArtifact};
use crate::clock::Clock;
use crate::config::{EngineConfig, UncertainDispatchPolicy};
use crate::dispatcher::{
    CoordinatorSignal, DispatchResult, ExecutionRequest, NodeExecutor, NodeOutcome,
    TaskDispatcher,
};
use crate::events::{EventEmitter, RunEvent};
use crate::graph::{FlowchartEdge, FlowchartNode, NodeType};
use crate::references::{missing_references, LocalFlowcharts, ReferenceChecker};
use crate::routing::{next_edges, plan_activations};
use crate::run::{
    node_idempotency_key, Activation, ArtifactHistoryEntry, FlowchartRun, FlowchartRunNode,
    InputContext, PulledDottedSource, ReplayMarker, RoutingState,
};
use crate::store::{FlowchartStore, RunRecord, StoreInner};
use crate::validation::validate_graph;

pub struct RunCoordinator {
    store: Arc<FlowchartStore>,
    artifacts: Arc<ArtifactStore>,
    pub(crate) dispatcher: TaskDispatcher,
    references: Arc<dyn ReferenceChecker>,
    events: EventEmitter,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    signal_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Everything a coordinator is built from.
pub struct CoordinatorParts {
    pub store: Arc<FlowchartStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub executor: Arc<dyn NodeExecutor>,
    pub references: Arc<dyn ReferenceChecker>,
    pub events: EventEmitter,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl RunCoordinator {
    /// Build a coordinator and start its signal loop on the current runtime.
    pub fn start(parts: CoordinatorParts) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let dispatcher = TaskDispatcher::new(
            parts.executor,
            signals_tx,
            parts.config.dispatch_max_retries,
            parts.config.dispatch_backoff.clone(),
        );
        let coordinator = Arc::new(Self {
            store: parts.store,
            artifacts: parts.artifacts,
            dispatcher,
            references: parts.references,
            events: parts.events,
            clock: parts.clock,
            config: parts.config,
            signal_loop: Mutex::new(None),
        });

        let handle = tokio::spawn(coordinator.clone().signal_loop(signals_rx));
        if let Ok(mut slot) = coordinator.signal_loop.lock() {
            *slot = Some(handle);
        }
        coordinator
    }

    /// Stop reacting to signals. In-flight dispatches keep running but their
    /// results are no longer recorded.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.signal_loop.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn store(&self) -> &Arc<FlowchartStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn signal_loop(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<CoordinatorSignal>) {
        let mut tick = tokio::time::interval(self.config.budget_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => {
                        if let Err(e) = self.handle_signal(signal) {
                            tracing::error!(error = %e, "Failed to apply coordinator signal");
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if let Err(e) = self.check_runtime_budgets() {
                        tracing::error!(error = %e, "Runtime budget check failed");
                    }
                }
            }
        }
    }

    pub(crate) fn handle_signal(&self, signal: CoordinatorSignal) -> Result<()> {
        match signal {
            CoordinatorSignal::RunReady {
                run_id,
                dispatch_id,
            } => self.on_run_ready(run_id, &dispatch_id),
            CoordinatorSignal::NodeFinished {
                run_id,
                run_node_id,
                dispatch_id,
                result,
            } => self.on_node_finished(run_id, run_node_id, &dispatch_id, result),
        }
    }

    // -----------------------------------------------------------------------
    // Run creation
    // -----------------------------------------------------------------------

    /// Validate the current graph and create a queued run against it.
    pub async fn start_run(&self, flowchart_id: FlowchartId) -> Result<FlowchartRun> {
        let (graph, local) = self.store.read(|tx| {
            Ok((
                tx.graph(flowchart_id)?.clone(),
                tx.flowchart_ids().collect::<HashSet<_>>(),
            ))
        })?;

        let diagnostics = validate_graph(&graph);
        if !diagnostics.is_empty() {
            tracing::warn!(flowchart_id, count = diagnostics.len(), "Run refused: graph invalid");
            return Err(SwitchyardError::Validation(diagnostics));
        }
        let checker = LocalFlowcharts {
            local,
            external: self.references.as_ref(),
        };
        let missing = missing_references(&graph, &checker).await?;
        if !missing.is_empty() {
            tracing::warn!(flowchart_id, count = missing.len(), "Run refused: missing references");
            return Err(SwitchyardError::Validation(missing));
        }

        self.store.transaction(|tx| {
            let current = tx.graph(flowchart_id)?.version;
            if current != graph.version {
                return Err(SwitchyardError::Conflict(format!(
                    "flowchart {flowchart_id} graph changed from version {} to {current} while starting a run",
                    graph.version
                )));
            }
            let budgets = tx.flowchart(flowchart_id)?.budgets;
            let run_id = tx.allocate_run_id();
            let ticket = self.dispatcher.dispatch_run(run_id)?;
            let now = self.now();
            let run = FlowchartRun {
                id: run_id,
                flowchart_id,
                status: RunStatus::Queued,
                dispatch_id: Some(ticket.dispatch_id.clone()),
                graph_version: graph.version,
                created_at: now,
                started_at: None,
                finished_at: None,
                error: None,
                executed_nodes: 0,
                artifact_history: Vec::new(),
            };
            tx.insert_run(RunRecord {
                run: run.clone(),
                graph,
                budgets,
                nodes: Default::default(),
                pending: VecDeque::new(),
                fan_in: Default::default(),
                unrecovered: BTreeSet::new(),
                next_execution_index: 0,
            });
            tracing::info!(run_id, flowchart_id, dispatch_id = %ticket.dispatch_id, "Run queued");
            self.events.emit(RunEvent::RunQueued {
                run_id,
                flowchart_id,
                dispatch_id: ticket.dispatch_id,
            });
            Ok(run)
        })
    }

    fn on_run_ready(&self, run_id: RunId, dispatch_id: &str) -> Result<()> {
        self.store.transaction(|tx| {
            let now = self.now();
            let record = tx.run_mut(run_id)?;
            if record.run.status != RunStatus::Queued
                || record.run.dispatch_id.as_deref() != Some(dispatch_id)
            {
                tracing::debug!(run_id, dispatch_id, status = %record.run.status, "Stale run dispatch ignored");
                return Ok(());
            }
            record.run.started_at = Some(now);
            self.set_status(record, RunStatus::Running, now);
            self.events.emit(RunEvent::RunStarted { run_id });

            match record.graph.start_node().map(|n| n.id) {
                Some(start) => record.pending.push_back(Activation::new(start, vec![])),
                None => {
                    record.run.error = Some("graph has no unique start node".into());
                    self.set_status(record, RunStatus::Failed, now);
                    return Ok(());
                }
            }
            self.advance(tx, run_id, now)
        })
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn on_node_finished(
        &self,
        run_id: RunId,
        run_node_id: RunNodeId,
        dispatch_id: &str,
        result: DispatchResult,
    ) -> Result<()> {
        self.store.transaction(|tx| {
            let now = self.now();
            {
                let record = tx.run_mut(run_id)?;
                let Some(node) = record.nodes.get(&run_node_id) else {
                    tracing::warn!(run_id, run_node_id, "Completion for unknown node run");
                    return Ok(());
                };
                if node.dispatch_id.as_deref() != Some(dispatch_id) || !node.status.is_in_flight() {
                    tracing::debug!(run_id, run_node_id, dispatch_id, status = %node.status, "Stale completion ignored");
                    return Ok(());
                }
            }

            match result {
                DispatchResult::Completed(outcome) => {
                    self.settle(tx, run_id, run_node_id, outcome, NodeRunStatus::Completed, false, now)?;
                }
                DispatchResult::Failed(message) => {
                    let record = tx.run_mut(run_id)?;
                    self.fail_node(record, run_node_id, message, false, now);
                }
                DispatchResult::Uncertain(message) => match self.config.uncertain_dispatch {
                    UncertainDispatchPolicy::Fail => {
                        let record = tx.run_mut(run_id)?;
                        self.fail_node(
                            record,
                            run_node_id,
                            format!("executor unavailable: {message}"),
                            true,
                            now,
                        );
                    }
                    UncertainDispatchPolicy::Degrade => {
                        if let Some(node) = tx.run_mut(run_id)?.nodes.get_mut(&run_node_id) {
                            node.dispatch_uncertain = true;
                            node.degraded = true;
                            node.degraded_reason = Some(format!("executor unavailable: {message}"));
                        }
                        tracing::warn!(run_id, run_node_id, "Dispatch uncertain, completing degraded");
                        self.settle(
                            tx,
                            run_id,
                            run_node_id,
                            NodeOutcome::default(),
                            NodeRunStatus::Completed,
                            true,
                            now,
                        )?;
                    }
                },
            }
            self.advance(tx, run_id, now)
        })
    }

    /// Record a node run's outcome and queue whatever it makes eligible.
    ///
    /// `lenient` routing lets a decision without a usable key end its branch
    /// instead of failing; it is used for skipped and degraded executions.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn settle(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        run_node_id: RunNodeId,
        outcome: NodeOutcome,
        status: NodeRunStatus,
        lenient: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = tx.run_mut(run_id)?;
        let run_node = record
            .nodes
            .get(&run_node_id)
            .cloned()
            .ok_or(SwitchyardError::NotFound {
                entity: "flowchart run node",
                id: run_node_id,
            })?;
        let Some(node) = record.graph.node(run_node.flowchart_node_id).cloned() else {
            self.fail_node(record, run_node_id, "node missing from run graph".into(), false, now);
            return Ok(());
        };

        let routed = next_edges(
            &record.graph,
            &node,
            outcome.routing_state.route_key.as_deref(),
            lenient,
        )
        .map(|(edges, fallback)| (edges.iter().map(|e| e.id).collect::<Vec<_>>(), fallback));

        let (edge_ids, fallback_applied) = match routed {
            Ok(routed) => routed,
            Err(message) => {
                if let Some(entry) = record.nodes.get_mut(&run_node_id) {
                    entry.output_state = outcome.output_state;
                    entry.routing_state = outcome.routing_state;
                }
                self.fail_node(record, run_node_id, message, false, now);
                return Ok(());
            }
        };

        self.store_artifacts(record, &run_node, &node, &outcome, now)?;

        if let Some(entry) = record.nodes.get_mut(&run_node_id) {
            entry.output_state = outcome.output_state;
            entry.routing_state = RoutingState {
                fallback_applied,
                ..outcome.routing_state
            };
            entry.started_at.get_or_insert(now);
            entry.finish(status, now);
        }
        tracing::info!(
            run_id,
            run_node_id,
            node_id = node.id,
            status = %status,
            fallback_applied,
            "Node run finished"
        );
        self.events.emit(RunEvent::NodeFinished {
            run_id,
            run_node_id,
            node_id: node.id,
            status,
        });

        if matches!(
            record.run.status,
            RunStatus::Running | RunStatus::Pausing | RunStatus::Paused
        ) {
            let edges: Vec<&FlowchartEdge> = edge_ids
                .iter()
                .filter_map(|id| record.graph.edge(*id))
                .collect();
            let activations = plan_activations(&record.graph, &mut record.fan_in, &run_node, &edges);
            record.pending.extend(activations);
        }
        Ok(())
    }

    fn store_artifacts(
        &self,
        record: &mut RunRecord,
        run_node: &FlowchartRunNode,
        node: &FlowchartNode,
        outcome: &NodeOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for draft in &outcome.artifacts {
            let artifact = self.artifacts.store(
                NewArtifact {
                    flowchart_id: record.run.flowchart_id,
                    flowchart_node_id: node.id,
                    flowchart_run_id: record.run.id,
                    flowchart_run_node_id: run_node.id,
                    artifact_type: draft.artifact_type.clone(),
                    ref_id: draft.ref_id.or(node.ref_id),
                    payload: ArtifactPayload::new(draft.data.clone()),
                    retention: node.config.retention(),
                    idempotency_key: draft
                        .idempotency_key
                        .clone()
                        .unwrap_or_else(|| draft.artifact_type.clone()),
                },
                now,
            )?;
            let history = &mut record.run.artifact_history;
            if history.iter().any(|h| h.artifact_id == artifact.id) {
                continue;
            }
            history.push(ArtifactHistoryEntry {
                artifact_id: artifact.id,
                run_node_id: run_node.id,
                node_id: node.id,
                artifact_type: artifact.artifact_type,
                created_at: artifact.created_at,
            });
            let limit = self.config.artifact_history_limit;
            if history.len() > limit {
                let excess = history.len() - limit;
                history.drain(..excess);
            }
        }
        Ok(())
    }

    pub(crate) fn fail_node(
        &self,
        record: &mut RunRecord,
        run_node_id: RunNodeId,
        message: String,
        uncertain: bool,
        now: DateTime<Utc>,
    ) {
        let Some(node) = record.nodes.get_mut(&run_node_id) else {
            return;
        };
        tracing::warn!(
            run_id = record.run.id,
            run_node_id,
            node_id = node.flowchart_node_id,
            error = %message,
            "Node run failed"
        );
        node.error = Some(message);
        node.dispatch_uncertain |= uncertain;
        node.finish(NodeRunStatus::Failed, now);
        let node_id = node.flowchart_node_id;
        record.unrecovered.insert(run_node_id);
        self.events.emit(RunEvent::NodeFinished {
            run_id: record.run.id,
            run_node_id,
            node_id,
            status: NodeRunStatus::Failed,
        });
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    /// Dispatch what the run allows, then settle its status.
    pub(crate) fn advance(&self, tx: &mut StoreInner, run_id: RunId, now: DateTime<Utc>) -> Result<()> {
        self.pump(tx, run_id, now)?;
        let record = tx.run_mut(run_id)?;
        self.evaluate_terminal(record, now);
        Ok(())
    }

    fn pump(&self, tx: &mut StoreInner, run_id: RunId, now: DateTime<Utc>) -> Result<()> {
        loop {
            let record = tx.run_mut(run_id)?;
            if !record.run.status.accepts_dispatch() || !record.unrecovered.is_empty() {
                return Ok(());
            }
            if self.runtime_exceeded(record, now) {
                self.fail_budget(record, "max_runtime_minutes", now);
                return Ok(());
            }
            let Some(next) = record.pending.front() else {
                return Ok(());
            };
            let Some(node) = record.graph.node(next.node_id).cloned() else {
                tracing::warn!(run_id, node_id = next.node_id, "Dropping activation for unknown node");
                record.pending.pop_front();
                continue;
            };

            let inline = matches!(node.node_type, NodeType::Start | NodeType::End);
            if !inline {
                if let Some(max) = record.budgets.max_parallel_nodes {
                    if record.in_flight_count() >= max as usize {
                        tracing::debug!(run_id, max, "Parallelism budget reached, queueing");
                        return Ok(());
                    }
                }
            }
            if let Some(max) = record.budgets.max_node_executions {
                if record.run.executed_nodes >= max {
                    self.fail_budget(record, "max_node_executions", now);
                    return Ok(());
                }
            }

            let Some(activation) = record.pending.pop_front() else {
                return Ok(());
            };
            record.run.executed_nodes += 1;
            let run_node_id = self.create_run_node(tx, run_id, activation, now)?;
            if inline {
                self.settle(
                    tx,
                    run_id,
                    run_node_id,
                    NodeOutcome::default(),
                    NodeRunStatus::Completed,
                    false,
                    now,
                )?;
            } else {
                self.dispatch_node(tx, run_id, run_node_id, node, now)?;
            }
        }
    }

    /// Allocate an execution index and create the run-node row.
    pub(crate) fn create_run_node(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        activation: Activation,
        now: DateTime<Utc>,
    ) -> Result<RunNodeId> {
        let id = tx.allocate_run_node_id(run_id);
        let record = tx.run_mut(run_id)?;
        let execution_index = record.allocate_index();
        let pulled_dotted_sources = self.pull_dotted(record, activation.node_id, now);
        let node = FlowchartRunNode {
            id,
            flowchart_run_id: run_id,
            flowchart_node_id: activation.node_id,
            execution_index,
            status: NodeRunStatus::Queued,
            input_context: InputContext {
                trigger_sources: activation.trigger_sources,
                pulled_dotted_sources,
                replay: activation.replay,
            },
            output_state: serde_json::Value::Null,
            routing_state: RoutingState::default(),
            error: None,
            degraded: false,
            degraded_reason: None,
            dispatch_id: None,
            dispatch_uncertain: false,
            idempotency_key: node_idempotency_key(
                run_id,
                activation.node_id,
                execution_index,
                activation.replay.as_ref(),
            ),
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        record.nodes.insert(id, node);
        Ok(id)
    }

    fn pull_dotted(
        &self,
        record: &RunRecord,
        node_id: switchyard_types::NodeId,
        now: DateTime<Utc>,
    ) -> Vec<PulledDottedSource> {
        let mut pulled = Vec::new();
        for edge in record.graph.incoming_dotted(node_id) {
            match self
                .artifacts
                .latest_for_node(record.run.flowchart_id, edge.source_node_id, now)
            {
                Ok(Some(artifact)) => pulled.push(PulledDottedSource {
                    edge_id: edge.id,
                    source_node_id: edge.source_node_id,
                    artifact_id: artifact.id,
                    payload: artifact.payload,
                }),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    run_id = record.run.id,
                    edge_id = edge.id,
                    error = %e,
                    "Dotted source unavailable"
                ),
            }
        }
        pulled
    }

    fn dispatch_node(
        &self,
        tx: &mut StoreInner,
        run_id: RunId,
        run_node_id: RunNodeId,
        node: FlowchartNode,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = tx.run_mut(run_id)?;
        let Some(run_node) = record.nodes.get(&run_node_id) else {
            return Ok(());
        };
        let request = ExecutionRequest {
            run_id,
            run_node_id,
            flowchart_id: record.run.flowchart_id,
            execution_index: run_node.execution_index,
            node,
            input_context: run_node.input_context.clone(),
            idempotency_key: run_node.idempotency_key.clone(),
        };
        let node_id = request.node.id;
        let execution_index = request.execution_index;

        match self.dispatcher.dispatch(request) {
            Ok(ticket) => {
                let Some(run_node) = record.nodes.get_mut(&run_node_id) else {
                    return Ok(());
                };
                if !run_node.assign_dispatch(ticket.dispatch_id.clone()) {
                    tracing::error!(run_id, run_node_id, "Refusing to reassign dispatch id");
                    return Ok(());
                }
                run_node.status = NodeRunStatus::Running;
                run_node.started_at = Some(now);
                tracing::info!(
                    run_id,
                    run_node_id,
                    node_id,
                    execution_index,
                    dispatch_id = %ticket.dispatch_id,
                    "Node dispatched"
                );
                self.events.emit(RunEvent::NodeDispatched {
                    run_id,
                    run_node_id,
                    node_id,
                    execution_index,
                    dispatch_id: ticket.dispatch_id,
                });
            }
            Err(e) => {
                self.fail_node(record, run_node_id, format!("dispatch failed: {e}"), true, now);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status changes, budgets, termination
    // -----------------------------------------------------------------------

    pub(crate) fn set_status(&self, record: &mut RunRecord, to: RunStatus, now: DateTime<Utc>) {
        let from = record.run.status;
        if from == to {
            return;
        }
        record.run.status = to;
        tracing::info!(run_id = record.run.id, from = %from, to = %to, "Run status changed");
        self.events.emit(RunEvent::RunStatusChanged {
            run_id: record.run.id,
            from,
            to,
        });
        if to.is_terminal() {
            record.run.finished_at = Some(now);
            record.pending.clear();
            record.fan_in.clear();
            self.events.emit(RunEvent::RunFinished {
                run_id: record.run.id,
                status: to,
                error: record.run.error.clone(),
            });
        }
    }

    /// Cancel every in-flight node run. Returns the canceled rows.
    pub(crate) fn cancel_in_flight(
        &self,
        record: &mut RunRecord,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Vec<FlowchartRunNode> {
        let run_id = record.run.id;
        let mut canceled = Vec::new();
        for node in record.nodes.values_mut().filter(|n| n.status.is_in_flight()) {
            if let Some(dispatch_id) = &node.dispatch_id {
                self.dispatcher.cancel(dispatch_id, true);
            }
            node.error = Some(reason.to_string());
            node.finish(NodeRunStatus::Canceled, now);
            self.events.emit(RunEvent::NodeFinished {
                run_id,
                run_node_id: node.id,
                node_id: node.flowchart_node_id,
                status: NodeRunStatus::Canceled,
            });
            canceled.push(node.clone());
        }
        canceled
    }

    fn fail_budget(&self, record: &mut RunRecord, budget: &str, now: DateTime<Utc>) {
        let error = SwitchyardError::BudgetExceeded {
            run_id: record.run.id,
            budget: budget.to_string(),
        };
        tracing::warn!(run_id = record.run.id, budget, "Run budget exceeded");
        record.run.error = Some(error.to_string());
        self.cancel_in_flight(record, &error.to_string(), now);
        self.set_status(record, RunStatus::Failed, now);
    }

    fn runtime_exceeded(&self, record: &RunRecord, now: DateTime<Utc>) -> bool {
        let (Some(max), Some(started)) = (record.budgets.max_runtime_minutes, record.run.started_at)
        else {
            return false;
        };
        let minutes = i64::try_from(max).unwrap_or(i64::MAX).min(i64::MAX / 60_000);
        let limit = chrono::Duration::minutes(minutes);
        now - started >= limit
    }

    /// Fail every started, unfinished run that is past its runtime budget.
    pub fn check_runtime_budgets(&self) -> Result<usize> {
        self.store.transaction(|tx| {
            let now = self.now();
            let mut failed = 0;
            for run_id in tx.run_ids() {
                let record = tx.run_mut(run_id)?;
                if matches!(
                    record.run.status,
                    RunStatus::Running | RunStatus::Pausing | RunStatus::Paused
                ) && self.runtime_exceeded(record, now)
                {
                    self.fail_budget(record, "max_runtime_minutes", now);
                    failed += 1;
                }
            }
            Ok(failed)
        })
    }

    pub(crate) fn evaluate_terminal(&self, record: &mut RunRecord, now: DateTime<Utc>) {
        if record.in_flight_count() > 0 {
            return;
        }
        match record.run.status {
            RunStatus::Running => {
                if let Some(failed) = record.unrecovered.iter().next().copied() {
                    if record.run.error.is_none() {
                        let message = record
                            .nodes
                            .get(&failed)
                            .and_then(|n| n.error.clone())
                            .unwrap_or_else(|| "unknown error".into());
                        record.run.error = Some(format!("node run {failed} failed: {message}"));
                    }
                    self.set_status(record, RunStatus::Failed, now);
                } else if record.pending.is_empty() {
                    self.set_status(record, RunStatus::Completed, now);
                }
            }
            RunStatus::Stopping => self.set_status(record, RunStatus::Stopped, now),
            RunStatus::Pausing => self.set_status(record, RunStatus::Paused, now),
            _ => {}
        }
    }

    /// The in-flight or pending work already tagged with `marker`, if any.
    pub(crate) fn find_replay(
        record: &RunRecord,
        marker: &ReplayMarker,
    ) -> Option<Option<FlowchartRunNode>> {
        if let Some(node) = record
            .in_flight()
            .find(|n| n.input_context.replay.as_ref() == Some(marker))
        {
            return Some(Some(node.clone()));
        }
        record
            .pending
            .iter()
            .any(|a| a.replay.as_ref() == Some(marker))
            .then_some(None)
    }

    // -----------------------------------------------------------------------
    // Recovery and waiting
    // -----------------------------------------------------------------------

    /// Resume runs after a restart from a snapshot.
    ///
    /// Queued runs get a fresh run dispatch. Node runs whose dispatch did not
    /// survive are canceled, flagged uncertain, and replaced by a fresh
    /// activation. Returns how many runs were touched.
    pub fn recover(&self) -> Result<usize> {
        self.store.transaction(|tx| {
            let now = self.now();
            let mut touched = 0;
            for run_id in tx.run_ids() {
                let status = tx.run(run_id)?.run.status;
                if status.is_terminal() {
                    continue;
                }
                if status == RunStatus::Queued {
                    let ticket = self.dispatcher.dispatch_run(run_id)?;
                    tx.run_mut(run_id)?.run.dispatch_id = Some(ticket.dispatch_id);
                    tracing::info!(run_id, "Re-dispatched queued run");
                    touched += 1;
                    continue;
                }

                let record = tx.run_mut(run_id)?;
                let mut replacements = Vec::new();
                for node in record.nodes.values_mut().filter(|n| n.status.is_in_flight()) {
                    let alive = node
                        .dispatch_id
                        .as_deref()
                        .is_some_and(|d| self.dispatcher.is_in_flight(d));
                    if alive {
                        continue;
                    }
                    node.dispatch_uncertain = true;
                    node.degraded = true;
                    node.degraded_reason = Some("dispatch lost before completion".into());
                    node.finish(NodeRunStatus::Canceled, now);
                    replacements.push(Activation {
                        node_id: node.flowchart_node_id,
                        trigger_sources: node.input_context.trigger_sources.clone(),
                        replay: node.input_context.replay,
                    });
                }
                if !replacements.is_empty() {
                    tracing::warn!(run_id, lost = replacements.len(), "Replacing lost dispatches");
                }
                for activation in replacements.into_iter().rev() {
                    record.pending.push_front(activation);
                }
                self.advance(tx, run_id, now)?;
                touched += 1;
            }
            Ok(touched)
        })
    }

    pub fn get_run(&self, run_id: RunId) -> Result<FlowchartRun> {
        self.store.read(|tx| Ok(tx.run(run_id)?.run.clone()))
    }

    /// Wait until the run's status satisfies `done` or `timeout` elapses, and
    /// return the run as last seen.
    pub async fn wait_for_status(
        &self,
        run_id: RunId,
        done: impl Fn(RunStatus) -> bool,
        timeout: Duration,
    ) -> Result<FlowchartRun> {
        let mut events = self.events.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_run(run_id)?;
            if done(run.status) {
                return Ok(run);
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) | Ok(Err(RecvError::Closed)) => return Ok(run),
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlAction;
    use crate::dispatcher::{ExecutorError, NodeOutcome};
    use crate::graph::test_support::*;
    use crate::graph::FlowchartGraph;
    use crate::references::AllowAllReferences;
    use crate::store::RunBudgets;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use serde_json::json;

    /// Never answers.
    struct Stalled;

    #[async_trait]
    impl NodeExecutor for Stalled {
        async fn execute(
            &self,
            _request: &ExecutionRequest,
        ) -> std::result::Result<NodeOutcome, ExecutorError> {
            std::future::pending().await
        }
    }

    fn coordinator() -> (Arc<RunCoordinator>, FlowchartId) {
        let store = Arc::new(FlowchartStore::new());
        let flowchart_id = store
            .transaction(|tx| {
                let fc = tx.create_flowchart("unit".into(), RunBudgets::default(), Utc::now());
                tx.put_graph(FlowchartGraph::new(
                    fc.id,
                    1,
                    vec![
                        node(1, NodeType::Start, json!({})),
                        node(2, NodeType::Task, json!({"prompt": "x"})),
                        node(3, NodeType::End, json!({})),
                    ],
                    vec![edge(10, 1, 2), edge(11, 2, 3)],
                ));
                Ok(fc.id)
            })
            .unwrap();
        let coordinator = RunCoordinator::start(CoordinatorParts {
            store,
            artifacts: Arc::new(ArtifactStore::new()),
            executor: Arc::new(Stalled),
            references: Arc::new(AllowAllReferences),
            events: EventEmitter::default(),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        });
        (coordinator, flowchart_id)
    }

    async fn wait_in_flight(coordinator: &RunCoordinator, run_id: RunId) -> FlowchartRunNode {
        for _ in 0..500 {
            let found = coordinator
                .store()
                .read(|tx| Ok(tx.run(run_id)?.in_flight().next().cloned()))
                .unwrap();
            if let Some(node) = found {
                if node.dispatch_id.is_some() {
                    return node;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no node run went in flight");
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let (coordinator, fid) = coordinator();
        let run = coordinator.start_run(fid).await.unwrap();
        let in_flight = wait_in_flight(&coordinator, run.id).await;

        coordinator
            .handle_signal(CoordinatorSignal::NodeFinished {
                run_id: run.id,
                run_node_id: in_flight.id,
                dispatch_id: "not-the-dispatch".into(),
                result: DispatchResult::Completed(NodeOutcome::default()),
            })
            .unwrap();

        let after = coordinator
            .store()
            .read(|tx| Ok(tx.run_node(in_flight.id)?.clone()))
            .unwrap();
        assert_eq!(after.status, NodeRunStatus::Running);
        assert_eq!(coordinator.get_run(run.id).unwrap().status, RunStatus::Running);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn queued_run_refuses_pause_and_stops_on_cancel() {
        let (coordinator, fid) = coordinator();
        // Nothing has yielded since the run was created, so the run-level
        // dispatch has not fired yet.
        let run = coordinator.start_run(fid).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        let err = coordinator.control_run(run.id, ControlAction::Pause).unwrap_err();
        assert!(matches!(err, SwitchyardError::InvalidTransition { .. }));

        let outcome = coordinator
            .control_run(run.id, ControlAction::Cancel { force: false })
            .unwrap();
        assert_eq!(outcome.run.status, RunStatus::Stopped);
        assert!(outcome.run.finished_at.is_some());

        // The revoked run dispatch never starts the run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.get_run(run.id).unwrap().status, RunStatus::Stopped);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn duplicate_rewind_returns_existing_activation() {
        let (coordinator, fid) = coordinator();
        let run = coordinator.start_run(fid).await.unwrap();
        wait_in_flight(&coordinator, run.id).await;
        let start = coordinator
            .store()
            .read(|tx| Ok(tx.run(run.id)?.node_runs()[0].clone()))
            .unwrap();

        coordinator.control_run(run.id, ControlAction::Pause).unwrap();
        let first = coordinator
            .control_run(run.id, ControlAction::Rewind { target: start.id })
            .unwrap();
        // The in-flight task was superseded and the rewind is pending.
        assert_eq!(first.affected_node_runs.len(), 1);
        assert_eq!(first.affected_node_runs[0].status, NodeRunStatus::Canceled);
        assert_eq!(first.run.status, RunStatus::Paused);

        let second = coordinator
            .control_run(run.id, ControlAction::Rewind { target: start.id })
            .unwrap();
        assert!(second.affected_node_runs.is_empty());
        let pending = coordinator
            .store()
            .read(|tx| Ok(tx.run(run.id)?.pending.len()))
            .unwrap();
        assert_eq!(pending, 1);
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn runtime_budget_ignores_unstarted_runs() {
        let (coordinator, fid) = coordinator();
        coordinator
            .store()
            .transaction(|tx| {
                tx.flowchart_mut(fid)?.budgets.max_runtime_minutes = Some(0);
                Ok(())
            })
            .unwrap();
        let run = coordinator.start_run(fid).await.unwrap();
        assert_eq!(coordinator.check_runtime_budgets().unwrap(), 0);

        let run = coordinator
            .wait_for_status(run.id, RunStatus::is_terminal, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("max_runtime_minutes"));
        coordinator.shutdown();
    }
}
