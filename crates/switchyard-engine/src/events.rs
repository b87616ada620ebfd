//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, UIs, the CLI's progress output, waiters in
//! [`crate::FlowchartService::wait_for_run`]) can follow run progress without
//! coupling to the coordinator internals.

use serde::{Deserialize, Serialize};
use switchyard_types::{FlowchartId, NodeId, NodeRunStatus, RunId, RunNodeId, RunStatus};

/// Events emitted while runs execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunQueued {
        run_id: RunId,
        flowchart_id: FlowchartId,
        dispatch_id: String,
    },
    RunStarted {
        run_id: RunId,
    },
    NodeDispatched {
        run_id: RunId,
        run_node_id: RunNodeId,
        node_id: NodeId,
        execution_index: u64,
        dispatch_id: String,
    },
    NodeFinished {
        run_id: RunId,
        run_node_id: RunNodeId,
        node_id: NodeId,
        status: NodeRunStatus,
    },
    RunStatusChanged {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    },
    ArtifactsPruned {
        count: usize,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            RunEvent::RunQueued { run_id, .. }
            | RunEvent::RunStarted { run_id }
            | RunEvent::NodeDispatched { run_id, .. }
            | RunEvent::NodeFinished { run_id, .. }
            | RunEvent::RunStatusChanged { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => Some(*run_id),
            RunEvent::ArtifactsPruned { .. } => None,
        }
    }
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observers_see_a_run_in_emission_order() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(RunEvent::RunStarted { run_id: 3 });
        emitter.emit(RunEvent::RunFinished {
            run_id: 3,
            status: RunStatus::Completed,
            error: None,
        });

        assert!(matches!(rx.recv().await.unwrap(), RunEvent::RunStarted { run_id: 3 }));
        match rx.recv().await.unwrap() {
            RunEvent::RunFinished { status, .. } => assert_eq!(status, RunStatus::Completed),
            other => panic!("expected RunFinished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let emitter = EventEmitter::default();
        emitter.emit(RunEvent::ArtifactsPruned { count: 2 });

        let mut rx = emitter.subscribe();
        emitter.emit(RunEvent::RunStarted { run_id: 9 });
        assert_eq!(rx.recv().await.unwrap().run_id(), Some(9));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let emitter = EventEmitter::new(0);
        let mut rx = emitter.subscribe();
        emitter.emit(RunEvent::RunStarted { run_id: 1 });
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn only_artifact_events_lack_a_run() {
        let event = RunEvent::NodeFinished {
            run_id: 8,
            run_node_id: 2,
            node_id: 5,
            status: NodeRunStatus::Skipped,
        };
        assert_eq!(event.run_id(), Some(8));
        assert_eq!(RunEvent::ArtifactsPruned { count: 0 }.run_id(), None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["NodeFinished"]["status"], "skipped");
    }
}
