//! Flowchart orchestration engine.
//!
//! This crate implements the core of Switchyard: the typed flowchart graph and
//! its validator, decision and fan-in routing, artifact retention, dispatch to
//! an external executor, and the run coordinator with operator control
//! (pause, resume, cancel, retry, skip, rewind).

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod dispatcher;
pub mod events;
pub mod graph;
pub mod node_config;
pub mod references;
pub mod retry;
pub mod routing;
pub mod run;
pub mod service;
pub mod store;
pub mod validation;

pub use artifacts::{
    spawn_retention_sweeper, ArtifactFilter, ArtifactPayload, ArtifactStore, NewArtifact,
    NodeArtifact, RetentionPolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, UncertainDispatchPolicy};
pub use control::{ControlAction, ControlOutcome};
pub use coordinator::{CoordinatorParts, RunCoordinator};
pub use dispatcher::{
    ArtifactDraft, ExecutionRequest, ExecutorError, NodeExecutor, NodeOutcome, TaskDispatcher,
};
pub use events::{EventEmitter, RunEvent};
pub use graph::{
    EdgeDraft, EdgeMode, FlowchartEdge, FlowchartGraph, FlowchartNode, NodeBindings, NodeDraft,
    NodeRef, NodeType, ReferenceKind,
};
pub use node_config::{FanInMode, NodeConfig};
pub use references::{
    ensure_refs, missing_references, AllowAllReferences, EnsureRef, NoProvisioning,
    ReferenceChecker, StaticReferences,
};
pub use retry::{execute_with_retry, BackoffPolicy, Retryable};
pub use routing::{next_edges, route_decision};
pub use run::{FlowchartRun, FlowchartRunNode, ReplayAction, ReplayMarker, RoutingState};
pub use service::{FlowchartService, GraphReport, RunReport, ServiceBuilder};
pub use store::{Flowchart, FlowchartStore, NodeRunFilter, RunBudgets};
pub use switchyard_types::{Diagnostic, NodeRunStatus, RunStatus, SwitchyardError};
pub use validation::{validate, validate_graph, validate_or_raise};
