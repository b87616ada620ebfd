//! External reference checks and explicit reference provisioning.
//!
//! Plan, milestone and memory nodes point at entities owned by other
//! services; subflow nodes point at another flowchart. The engine only ever
//! asks whether they exist. Creating missing ones is the caller's choice,
//! made through an [`EnsureRef`] strategy before validation runs.

use std::collections::HashSet;

use async_trait::async_trait;
use switchyard_types::{Diagnostic, FlowchartId, Result};

use crate::graph::{FlowchartGraph, NodeDraft, NodeType, ReferenceKind};

#[async_trait]
pub trait ReferenceChecker: Send + Sync {
    async fn exists(&self, kind: ReferenceKind, id: i64) -> Result<bool>;
}

/// A fixed set of known references.
#[derive(Debug, Clone, Default)]
pub struct StaticReferences {
    known: HashSet<(ReferenceKind, i64)>,
}

impl StaticReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ReferenceKind, id: i64) -> Self {
        self.known.insert((kind, id));
        self
    }

    pub fn insert(&mut self, kind: ReferenceKind, id: i64) {
        self.known.insert((kind, id));
    }
}

#[async_trait]
impl ReferenceChecker for StaticReferences {
    async fn exists(&self, kind: ReferenceKind, id: i64) -> Result<bool> {
        Ok(self.known.contains(&(kind, id)))
    }
}

/// Accepts every reference. Useful for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllReferences;

#[async_trait]
impl ReferenceChecker for AllowAllReferences {
    async fn exists(&self, _kind: ReferenceKind, _id: i64) -> Result<bool> {
        Ok(true)
    }
}

/// Answers flowchart references from a local id set and defers every other
/// kind to an external checker.
pub(crate) struct LocalFlowcharts<'a> {
    pub local: HashSet<FlowchartId>,
    pub external: &'a dyn ReferenceChecker,
}

#[async_trait]
impl ReferenceChecker for LocalFlowcharts<'_> {
    async fn exists(&self, kind: ReferenceKind, id: i64) -> Result<bool> {
        match kind {
            ReferenceKind::Flowchart => Ok(self.local.contains(&id)),
            _ => self.external.exists(kind, id).await,
        }
    }
}

/// One diagnostic per node whose `ref_id` does not resolve.
pub async fn missing_references(
    graph: &FlowchartGraph,
    checker: &dyn ReferenceChecker,
) -> Result<Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    for node in graph.all_nodes() {
        let (Some(kind), Some(ref_id)) = (node.node_type.reference_kind(), node.ref_id) else {
            continue;
        };
        if !checker.exists(kind, ref_id).await? {
            diagnostics.push(Diagnostic::node(
                "reference_exists",
                node.id.to_string(),
                format!(
                    "{} node '{}' references missing {kind} {ref_id}",
                    node.node_type, node.id
                ),
            ));
        }
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// EnsureRef: explicit provisioning
// ---------------------------------------------------------------------------

/// Strategy for provisioning a missing reference.
///
/// Returning `Ok(None)` leaves the node untouched, so validation reports the
/// missing reference as usual.
#[async_trait]
pub trait EnsureRef: Send + Sync {
    async fn ensure(
        &self,
        flowchart_id: FlowchartId,
        kind: ReferenceKind,
        node: &NodeDraft,
    ) -> Result<Option<i64>>;
}

/// Never provisions anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProvisioning;

#[async_trait]
impl EnsureRef for NoProvisioning {
    async fn ensure(
        &self,
        _flowchart_id: FlowchartId,
        _kind: ReferenceKind,
        _node: &NodeDraft,
    ) -> Result<Option<i64>> {
        Ok(None)
    }
}

/// Fill in `ref_id` for every draft that needs one and lacks it.
/// Returns how many nodes were provisioned.
pub async fn ensure_refs(
    flowchart_id: FlowchartId,
    nodes: &mut [NodeDraft],
    strategy: &dyn EnsureRef,
) -> Result<usize> {
    let mut provisioned = 0;
    for node in nodes.iter_mut() {
        if node.ref_id.is_some() {
            continue;
        }
        let Some(kind) = node
            .node_type
            .parse::<NodeType>()
            .ok()
            .and_then(NodeType::reference_kind)
        else {
            continue;
        };
        if let Some(ref_id) = strategy.ensure(flowchart_id, kind, node).await? {
            tracing::debug!(flowchart_id, %kind, ref_id, "Provisioned node reference");
            node.ref_id = Some(ref_id);
            provisioned += 1;
        }
    }
    Ok(provisioned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::node;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Counter(AtomicI64);

    #[async_trait]
    impl EnsureRef for Counter {
        async fn ensure(
            &self,
            _flowchart_id: FlowchartId,
            kind: ReferenceKind,
            _node: &NodeDraft,
        ) -> Result<Option<i64>> {
            Ok(match kind {
                ReferenceKind::Memory => Some(self.0.fetch_add(1, Ordering::SeqCst)),
                _ => None,
            })
        }
    }

    #[tokio::test]
    async fn ensure_refs_only_touches_missing_refs() {
        let mut nodes = vec![
            NodeDraft::keyed("m1", "memory"),
            NodeDraft::keyed("m2", "memory").with_ref(5),
            NodeDraft::keyed("p", "plan"),
            NodeDraft::keyed("t", "task"),
        ];
        let strategy = Counter(AtomicI64::new(40));
        let count = ensure_refs(1, &mut nodes, &strategy).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(nodes[0].ref_id, Some(40));
        assert_eq!(nodes[1].ref_id, Some(5));
        assert_eq!(nodes[2].ref_id, None);
        assert_eq!(nodes[3].ref_id, None);
    }

    #[tokio::test]
    async fn missing_references_reported_per_node() {
        let graph = FlowchartGraph::new(
            1,
            1,
            vec![
                node(1, NodeType::Start, json!({})),
                node(2, NodeType::Plan, json!({})),
                node(3, NodeType::Subflow, json!({})),
            ],
            vec![],
        );
        let external = StaticReferences::new().with(ReferenceKind::Plan, 102);
        let checker = LocalFlowcharts {
            local: HashSet::new(),
            external: &external,
        };
        let diags = missing_references(&graph, &checker).await.unwrap();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].node_id.as_deref(), Some("3"));
        assert!(diags[0].message.contains("flowchart 103"));
    }
}
