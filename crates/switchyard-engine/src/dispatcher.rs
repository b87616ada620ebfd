//! Hand-off of node work to the executor collaborator.
//!
//! Every dispatch runs on its own tokio task and reports back to the
//! coordinator over an mpsc channel. An in-flight registry keyed by
//! idempotency key guarantees at most one live dispatch per key; a repeat
//! dispatch returns the existing dispatch id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard_types::{FlowchartId, Result, RunId, RunNodeId, SwitchyardError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::graph::FlowchartNode;
use crate::node_config::KindConfig;
use crate::retry::{execute_with_retry, BackoffPolicy, Retryable};
use crate::run::{run_idempotency_key, InputContext, RoutingState};

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// Everything an executor needs to perform one node execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub run_id: RunId,
    pub run_node_id: RunNodeId,
    pub flowchart_id: FlowchartId,
    pub execution_index: u64,
    pub node: FlowchartNode,
    pub input_context: InputContext,
    pub idempotency_key: String,
}

/// An artifact the executor wants stored for this execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub artifact_type: String,
    #[serde(default)]
    pub ref_id: Option<i64>,
    pub data: serde_json::Value,
    /// Defaults to the artifact type when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    #[serde(default)]
    pub output_state: serde_json::Value,
    #[serde(default)]
    pub routing_state: RoutingState,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDraft>,
}

impl NodeOutcome {
    pub fn output(output_state: serde_json::Value) -> Self {
        Self {
            output_state,
            ..Default::default()
        }
    }

    pub fn routed(route_key: impl Into<String>) -> Self {
        Self {
            routing_state: RoutingState::keyed(route_key),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact_type: &str, data: serde_json::Value) -> Self {
        self.artifacts.push(ArtifactDraft {
            artifact_type: artifact_type.to_string(),
            ref_id: None,
            data,
            idempotency_key: None,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    /// The executor could not be reached. Retried at the dispatch layer.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
    /// The node's work ran and failed. Never retried automatically.
    #[error("{0}")]
    Failed(String),
}

impl Retryable for ExecutorError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Unavailable(_))
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<NodeOutcome, ExecutorError>;
}

// ---------------------------------------------------------------------------
// Coordinator signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum DispatchResult {
    Completed(NodeOutcome),
    Failed(String),
    /// The executor stayed unreachable through every retry.
    Uncertain(String),
}

#[derive(Debug, Clone)]
pub enum CoordinatorSignal {
    RunReady {
        run_id: RunId,
        dispatch_id: String,
    },
    NodeFinished {
        run_id: RunId,
        run_node_id: RunNodeId,
        dispatch_id: String,
        result: DispatchResult,
    },
}

/// Result of a dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTicket {
    pub dispatch_id: String,
    /// True when an in-flight dispatch for the same key was returned.
    pub reused: bool,
}

// ---------------------------------------------------------------------------
// TaskDispatcher
// ---------------------------------------------------------------------------

struct InFlight {
    dispatch_id: String,
    abort: Option<AbortHandle>,
    cancel_requested: bool,
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<String, InFlight>,
    key_by_dispatch: HashMap<String, String>,
}

impl Registry {
    fn remove_dispatch(&mut self, dispatch_id: &str) {
        if let Some(key) = self.key_by_dispatch.remove(dispatch_id) {
            self.by_key.remove(&key);
        }
    }
}

#[derive(Clone)]
pub struct TaskDispatcher {
    executor: Arc<dyn NodeExecutor>,
    signals: mpsc::UnboundedSender<CoordinatorSignal>,
    registry: Arc<Mutex<Registry>>,
    max_retries: usize,
    backoff: BackoffPolicy,
}

impl TaskDispatcher {
    pub fn new(
        executor: Arc<dyn NodeExecutor>,
        signals: mpsc::UnboundedSender<CoordinatorSignal>,
        max_retries: usize,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            executor,
            signals,
            registry: Arc::new(Mutex::new(Registry::default())),
            max_retries,
            backoff,
        }
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry.lock().map_err(|_| SwitchyardError::LockPoisoned)
    }

    /// Queue the run-level job that moves a queued run to running.
    pub fn dispatch_run(&self, run_id: RunId) -> Result<DispatchTicket> {
        let signals = self.signals.clone();
        let registry = self.registry.clone();
        self.register(run_idempotency_key(run_id), move |dispatch_id| async move {
            if let Ok(mut reg) = registry.lock() {
                reg.remove_dispatch(&dispatch_id);
            }
            let _ = signals.send(CoordinatorSignal::RunReady {
                run_id,
                dispatch_id,
            });
        })
    }

    /// Hand one node execution to the executor.
    pub fn dispatch(&self, request: ExecutionRequest) -> Result<DispatchTicket> {
        let executor = self.executor.clone();
        let signals = self.signals.clone();
        let registry = self.registry.clone();
        let max_retries = self.max_retries;
        let backoff = self.backoff.clone();
        let key = request.idempotency_key.clone();

        self.register(key, move |dispatch_id| async move {
            let target = format!("run node {}", request.run_node_id);
            let timeout = match &request.node.config.kind {
                KindConfig::Task(task) => task.timeout_seconds.map(Duration::from_secs),
                _ => None,
            };
            let attempt = execute_with_retry(
                || {
                    let executor = executor.clone();
                    let request = request.clone();
                    async move { executor.execute(&request).await }
                },
                max_retries,
                &backoff,
                &target,
            );
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                    Err(ExecutorError::Failed(format!(
                        "timed out after {}s",
                        limit.as_secs()
                    )))
                }),
                None => attempt.await,
            };

            let result = match outcome {
                Ok(outcome) => DispatchResult::Completed(outcome),
                Err(ExecutorError::Unavailable(message)) => DispatchResult::Uncertain(message),
                Err(ExecutorError::Failed(message)) => DispatchResult::Failed(message),
            };

            if let Ok(mut reg) = registry.lock() {
                reg.remove_dispatch(&dispatch_id);
            }
            let _ = signals.send(CoordinatorSignal::NodeFinished {
                run_id: request.run_id,
                run_node_id: request.run_node_id,
                dispatch_id,
                result,
            });
        })
    }

    fn register<F, Fut>(&self, key: String, job: F) -> Result<DispatchTicket>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let dispatch_id = {
            let mut reg = self.registry()?;
            if let Some(existing) = reg.by_key.get(&key) {
                tracing::debug!(key = %key, dispatch_id = %existing.dispatch_id, "Dispatch already in flight");
                return Ok(DispatchTicket {
                    dispatch_id: existing.dispatch_id.clone(),
                    reused: true,
                });
            }
            let dispatch_id = uuid::Uuid::new_v4().to_string();
            reg.key_by_dispatch.insert(dispatch_id.clone(), key.clone());
            reg.by_key.insert(
                key.clone(),
                InFlight {
                    dispatch_id: dispatch_id.clone(),
                    abort: None,
                    cancel_requested: false,
                },
            );
            dispatch_id
        };

        // The entry exists before the job runs, so its cleanup always finds it.
        let handle = tokio::spawn(job(dispatch_id.clone()));
        match self.registry() {
            Ok(mut reg) => match reg.by_key.get_mut(&key) {
                Some(entry) if entry.dispatch_id == dispatch_id => {
                    entry.abort = Some(handle.abort_handle());
                }
                // Force-cancelled before the handle was attached, or already done.
                _ => handle.abort(),
            },
            Err(e) => {
                handle.abort();
                return Err(e);
            }
        }
        tracing::debug!(key = %key, dispatch_id = %dispatch_id, "Dispatched");
        Ok(DispatchTicket {
            dispatch_id,
            reused: false,
        })
    }

    /// Best-effort cancellation. A forced cancel aborts the task; a plain one
    /// only records the request and lets the work finish.
    pub fn cancel(&self, dispatch_id: &str, force: bool) {
        let mut reg = match self.registry() {
            Ok(reg) => reg,
            Err(e) => {
                tracing::warn!(dispatch_id, error = %e, "Cancel skipped");
                return;
            }
        };
        let Some(key) = reg.key_by_dispatch.get(dispatch_id).cloned() else {
            tracing::debug!(dispatch_id, "Cancel for unknown or finished dispatch ignored");
            return;
        };
        if force {
            if let Some(entry) = reg.by_key.get_mut(&key) {
                if let Some(abort) = entry.abort.take() {
                    abort.abort();
                }
            }
            reg.remove_dispatch(dispatch_id);
            tracing::info!(dispatch_id, "Dispatch aborted");
        } else if let Some(entry) = reg.by_key.get_mut(&key) {
            entry.cancel_requested = true;
            tracing::info!(dispatch_id, "Cancellation requested");
        }
    }

    pub fn is_in_flight(&self, dispatch_id: &str) -> bool {
        self.registry()
            .map(|reg| reg.key_by_dispatch.contains_key(dispatch_id))
            .unwrap_or(false)
    }

    pub fn cancel_requested(&self, dispatch_id: &str) -> bool {
        self.registry()
            .ok()
            .and_then(|reg| {
                let key = reg.key_by_dispatch.get(dispatch_id)?;
                reg.by_key.get(key).map(|e| e.cancel_requested)
            })
            .unwrap_or(false)
    }

    pub fn in_flight_count(&self) -> usize {
        self.registry().map(|reg| reg.by_key.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::node;
    use crate::graph::NodeType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Gate {
        release: Arc<Notify>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NodeExecutor for Gate {
        async fn execute(
            &self,
            request: &ExecutionRequest,
        ) -> std::result::Result<NodeOutcome, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(NodeOutcome::output(json!({"node": request.node.id})))
        }
    }

    struct Flaky {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl NodeExecutor for Flaky {
        async fn execute(
            &self,
            _request: &ExecutionRequest,
        ) -> std::result::Result<NodeOutcome, ExecutorError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ExecutorError::Unavailable("connection refused".into()));
            }
            Ok(NodeOutcome::routed("yes"))
        }
    }

    fn request(key: &str, config: serde_json::Value) -> ExecutionRequest {
        ExecutionRequest {
            run_id: 1,
            run_node_id: 7,
            flowchart_id: 1,
            execution_index: 0,
            node: node(3, NodeType::Task, config),
            input_context: InputContext::default(),
            idempotency_key: key.to_string(),
        }
    }

    fn dispatcher(
        executor: Arc<dyn NodeExecutor>,
        retries: usize,
    ) -> (TaskDispatcher, mpsc::UnboundedReceiver<CoordinatorSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskDispatcher::new(executor, tx, retries, BackoffPolicy::None),
            rx,
        )
    }

    // Test 1: same key while in flight returns the same dispatch id
    #[tokio::test]
    async fn duplicate_key_reuses_dispatch() {
        let release = Arc::new(Notify::new());
        let gate = Arc::new(Gate {
            release: release.clone(),
            calls: AtomicUsize::new(0),
        });
        let (d, mut rx) = dispatcher(gate.clone(), 0);

        let first = d.dispatch(request("k", json!({"prompt": "p"}))).unwrap();
        let second = d.dispatch(request("k", json!({"prompt": "p"}))).unwrap();
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.dispatch_id, second.dispatch_id);

        release.notify_one();
        match rx.recv().await.unwrap() {
            CoordinatorSignal::NodeFinished {
                dispatch_id,
                result: DispatchResult::Completed(outcome),
                ..
            } => {
                assert_eq!(dispatch_id, first.dispatch_id);
                assert_eq!(outcome.output_state, json!({"node": 3}));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.in_flight_count(), 0);
    }

    // Test 2: unavailability is retried, then succeeds
    #[tokio::test]
    async fn unavailable_executor_retried() {
        let (d, mut rx) = dispatcher(
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(2),
            }),
            3,
        );
        d.dispatch(request("k", json!({"prompt": "p"}))).unwrap();
        match rx.recv().await.unwrap() {
            CoordinatorSignal::NodeFinished {
                result: DispatchResult::Completed(outcome),
                ..
            } => assert_eq!(outcome.routing_state.route_key.as_deref(), Some("yes")),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    // Test 3: exhausted retries report an uncertain dispatch
    #[tokio::test]
    async fn exhausted_retries_report_uncertain() {
        let (d, mut rx) = dispatcher(
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(10),
            }),
            1,
        );
        d.dispatch(request("k", json!({"prompt": "p"}))).unwrap();
        match rx.recv().await.unwrap() {
            CoordinatorSignal::NodeFinished {
                result: DispatchResult::Uncertain(message),
                ..
            } => assert!(message.contains("connection refused")),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    // Test 4: forced cancel aborts the task and no signal arrives
    #[tokio::test]
    async fn forced_cancel_aborts() {
        let release = Arc::new(Notify::new());
        let (d, mut rx) = dispatcher(
            Arc::new(Gate {
                release: release.clone(),
                calls: AtomicUsize::new(0),
            }),
            0,
        );
        let ticket = d.dispatch(request("k", json!({"prompt": "p"}))).unwrap();
        assert!(d.is_in_flight(&ticket.dispatch_id));

        d.cancel(&ticket.dispatch_id, true);
        assert!(!d.is_in_flight(&ticket.dispatch_id));
        release.notify_one();

        let waited = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(waited.is_err(), "aborted dispatch must not report back");
    }

    // Test 5: plain cancel only marks the request
    #[tokio::test]
    async fn plain_cancel_lets_work_finish() {
        let release = Arc::new(Notify::new());
        let (d, mut rx) = dispatcher(
            Arc::new(Gate {
                release: release.clone(),
                calls: AtomicUsize::new(0),
            }),
            0,
        );
        let ticket = d.dispatch(request("k", json!({"prompt": "p"}))).unwrap();
        d.cancel(&ticket.dispatch_id, false);
        assert!(d.cancel_requested(&ticket.dispatch_id));
        d.cancel("no-such-dispatch", true);

        release.notify_one();
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoordinatorSignal::NodeFinished { .. }
        ));
    }

    // Test 6: task timeout fails the execution
    #[tokio::test]
    async fn task_timeout_fails() {
        let (d, mut rx) = dispatcher(
            Arc::new(Gate {
                release: Arc::new(Notify::new()),
                calls: AtomicUsize::new(0),
            }),
            0,
        );
        d.dispatch(request("k", json!({"prompt": "p", "timeout_seconds": 1})))
            .unwrap();
        match rx.recv().await.unwrap() {
            CoordinatorSignal::NodeFinished {
                result: DispatchResult::Failed(message),
                ..
            } => assert_eq!(message, "timed out after 1s"),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    // Test 7: run-level dispatch reports readiness
    #[tokio::test]
    async fn run_dispatch_signals_ready() {
        let (d, mut rx) = dispatcher(
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(0),
            }),
            0,
        );
        let ticket = d.dispatch_run(42).unwrap();
        match rx.recv().await.unwrap() {
            CoordinatorSignal::RunReady {
                run_id,
                dispatch_id,
            } => {
                assert_eq!(run_id, 42);
                assert_eq!(dispatch_id, ticket.dispatch_id);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    // Test 8: jobs that finish before registration completes still clean up
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fast_jobs_leave_no_registry_entries() {
        let (d, mut rx) = dispatcher(
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(0),
            }),
            0,
        );
        let mut issued = std::collections::HashSet::new();
        for i in 0..64 {
            let ticket = d.dispatch(request(&format!("k{i}"), json!({"prompt": "p"}))).unwrap();
            assert!(!ticket.reused);
            issued.insert(ticket.dispatch_id);
        }
        for _ in 0..64 {
            match rx.recv().await.unwrap() {
                CoordinatorSignal::NodeFinished { dispatch_id, .. } => {
                    assert!(issued.remove(&dispatch_id));
                }
                other => panic!("unexpected signal: {other:?}"),
            }
        }
        assert!(issued.is_empty());
        assert_eq!(d.in_flight_count(), 0);
    }
}
