//! Flowchart topology: typed nodes and edges, the drafts callers submit to
//! replace a graph, and [`FlowchartGraph`], the indexed snapshot runs start
//! against.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use switchyard_types::{EdgeId, FlowchartId, NodeId};

use crate::node_config::NodeConfig;

// ---------------------------------------------------------------------------
// Node and edge kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Task,
    Decision,
    Plan,
    Milestone,
    Memory,
    Retrieval,
    Subflow,
}

/// External entity kinds a node may reference through `ref_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Plan,
    Milestone,
    Memory,
    Flowchart,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceKind::Plan => "plan",
            ReferenceKind::Milestone => "milestone",
            ReferenceKind::Memory => "memory",
            ReferenceKind::Flowchart => "flowchart",
        })
    }
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::Start,
        NodeType::End,
        NodeType::Task,
        NodeType::Decision,
        NodeType::Plan,
        NodeType::Milestone,
        NodeType::Memory,
        NodeType::Retrieval,
        NodeType::Subflow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Task => "task",
            NodeType::Decision => "decision",
            NodeType::Plan => "plan",
            NodeType::Milestone => "milestone",
            NodeType::Memory => "memory",
            NodeType::Retrieval => "retrieval",
            NodeType::Subflow => "subflow",
        }
    }

    /// The entity kind this node type must reference, or `None` when the type
    /// never carries a `ref_id`.
    pub fn reference_kind(self) -> Option<ReferenceKind> {
        match self {
            NodeType::Plan => Some(ReferenceKind::Plan),
            NodeType::Milestone => Some(ReferenceKind::Milestone),
            NodeType::Memory => Some(ReferenceKind::Memory),
            NodeType::Subflow => Some(ReferenceKind::Flowchart),
            _ => None,
        }
    }

    /// Maximum number of solid outgoing edges.
    pub fn max_solid_outgoing(self) -> usize {
        match self {
            NodeType::End => 0,
            NodeType::Decision => 3,
            _ => 1,
        }
    }

    pub fn allows_model(self) -> bool {
        matches!(
            self,
            NodeType::Task
                | NodeType::Decision
                | NodeType::Plan
                | NodeType::Milestone
                | NodeType::Memory
                | NodeType::Retrieval
        )
    }

    pub fn allows_mcp_servers(self) -> bool {
        self == NodeType::Task
    }

    pub fn allows_scripts(self) -> bool {
        self == NodeType::Task
    }

    pub fn allows_attachments(self) -> bool {
        matches!(self, NodeType::Task | NodeType::Retrieval)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown node type '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    Solid,
    Dotted,
}

impl EdgeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeMode::Solid => "solid",
            EdgeMode::Dotted => "dotted",
        }
    }
}

impl FromStr for EdgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "solid" => Ok(EdgeMode::Solid),
            "dotted" => Ok(EdgeMode::Dotted),
            other => Err(format!("unknown edge mode '{other}'")),
        }
    }
}

fn default_edge_mode() -> String {
    EdgeMode::Solid.as_str().to_string()
}

// ---------------------------------------------------------------------------
// Drafts: what callers hand to the replace boundary
// ---------------------------------------------------------------------------

/// Identity of a node inside a draft: a persisted id, or a caller-chosen key
/// for a node that has not been saved yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeRef {
    Id(NodeId),
    Key(String),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Id(id) => write!(f, "{id}"),
            NodeRef::Key(key) => f.write_str(key),
        }
    }
}

/// Model and tooling identifiers bound to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBindings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_server_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDraft {
    #[serde(default)]
    pub id: Option<NodeId>,
    #[serde(default)]
    pub client_key: Option<String>,
    pub node_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub ref_id: Option<i64>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub bindings: NodeBindings,
}

impl NodeDraft {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            id: None,
            client_key: None,
            node_type: node_type.into(),
            title: None,
            ref_id: None,
            x: 0.0,
            y: 0.0,
            config: serde_json::Value::Null,
            bindings: NodeBindings::default(),
        }
    }

    pub fn keyed(key: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            client_key: Some(key.into()),
            ..Self::new(node_type)
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_ref(mut self, ref_id: i64) -> Self {
        self.ref_id = Some(ref_id);
        self
    }

    /// The identity edges use to point at this node. Persisted ids win over
    /// client keys.
    pub fn node_ref(&self) -> Option<NodeRef> {
        self.id
            .map(NodeRef::Id)
            .or_else(|| self.client_key.clone().map(NodeRef::Key))
    }

    /// Human-readable label used in diagnostics.
    pub fn label(&self, index: usize) -> String {
        self.node_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| format!("#{index}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDraft {
    #[serde(default)]
    pub id: Option<EdgeId>,
    pub source: NodeRef,
    pub target: NodeRef,
    #[serde(default = "default_edge_mode")]
    pub edge_mode: String,
    #[serde(default)]
    pub condition_key: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl EdgeDraft {
    pub fn solid(source: impl Into<NodeRef>, target: impl Into<NodeRef>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            edge_mode: default_edge_mode(),
            condition_key: None,
            label: None,
        }
    }

    pub fn dotted(source: impl Into<NodeRef>, target: impl Into<NodeRef>) -> Self {
        Self {
            edge_mode: EdgeMode::Dotted.as_str().to_string(),
            ..Self::solid(source, target)
        }
    }

    pub fn keyed(mut self, condition_key: impl Into<String>) -> Self {
        self.condition_key = Some(condition_key.into());
        self
    }
}

impl From<&str> for NodeRef {
    fn from(key: &str) -> Self {
        NodeRef::Key(key.to_string())
    }
}

impl From<NodeId> for NodeRef {
    fn from(id: NodeId) -> Self {
        NodeRef::Id(id)
    }
}

// ---------------------------------------------------------------------------
// Persisted, typed graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NodeRecord", into = "NodeRecord")]
pub struct FlowchartNode {
    pub id: NodeId,
    pub flowchart_id: FlowchartId,
    pub node_type: NodeType,
    pub title: Option<String>,
    pub ref_id: Option<i64>,
    pub x: f64,
    pub y: f64,
    pub config: NodeConfig,
    pub bindings: NodeBindings,
}

/// Wire form of a node: the config travels as plain JSON and is re-parsed
/// into its typed form on the way back in.
#[derive(Serialize, Deserialize)]
struct NodeRecord {
    id: NodeId,
    flowchart_id: FlowchartId,
    node_type: NodeType,
    title: Option<String>,
    ref_id: Option<i64>,
    x: f64,
    y: f64,
    config: serde_json::Value,
    #[serde(default)]
    bindings: NodeBindings,
}

impl TryFrom<NodeRecord> for FlowchartNode {
    type Error = String;

    fn try_from(record: NodeRecord) -> Result<Self, Self::Error> {
        let config = NodeConfig::parse(record.node_type, &record.config)
            .map_err(|errors| errors.join("; "))?;
        Ok(FlowchartNode {
            id: record.id,
            flowchart_id: record.flowchart_id,
            node_type: record.node_type,
            title: record.title,
            ref_id: record.ref_id,
            x: record.x,
            y: record.y,
            config,
            bindings: record.bindings,
        })
    }
}

impl From<FlowchartNode> for NodeRecord {
    fn from(node: FlowchartNode) -> Self {
        NodeRecord {
            id: node.id,
            flowchart_id: node.flowchart_id,
            node_type: node.node_type,
            title: node.title,
            ref_id: node.ref_id,
            x: node.x,
            y: node.y,
            config: node.config.to_value(),
            bindings: node.bindings,
        }
    }
}

impl FlowchartNode {
    pub fn to_draft(&self) -> NodeDraft {
        NodeDraft {
            id: Some(self.id),
            client_key: None,
            node_type: self.node_type.as_str().to_string(),
            title: self.title.clone(),
            ref_id: self.ref_id,
            x: self.x,
            y: self.y,
            config: self.config.to_value(),
            bindings: self.bindings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowchartEdge {
    pub id: EdgeId,
    pub flowchart_id: FlowchartId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub edge_mode: EdgeMode,
    pub condition_key: Option<String>,
    pub label: Option<String>,
}

impl FlowchartEdge {
    pub fn is_solid(&self) -> bool {
        self.edge_mode == EdgeMode::Solid
    }

    pub fn to_draft(&self) -> EdgeDraft {
        EdgeDraft {
            id: Some(self.id),
            source: NodeRef::Id(self.source_node_id),
            target: NodeRef::Id(self.target_node_id),
            edge_mode: self.edge_mode.as_str().to_string(),
            condition_key: self.condition_key.clone(),
            label: self.label.clone(),
        }
    }
}

/// An immutable snapshot of one flowchart's topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "GraphParts", into = "GraphParts")]
pub struct FlowchartGraph {
    pub flowchart_id: FlowchartId,
    /// Bumped on every successful replacement.
    pub version: u64,
    nodes: BTreeMap<NodeId, FlowchartNode>,
    edges: Vec<FlowchartEdge>,
    /// Maps node_id to a range (start, count) into the sorted `edges` vec.
    /// Edges are sorted by source so each node's outgoing edges are contiguous.
    adjacency: HashMap<NodeId, (usize, usize)>,
}

#[derive(Serialize, Deserialize)]
struct GraphParts {
    flowchart_id: FlowchartId,
    version: u64,
    nodes: Vec<FlowchartNode>,
    edges: Vec<FlowchartEdge>,
}

impl From<GraphParts> for FlowchartGraph {
    fn from(parts: GraphParts) -> Self {
        FlowchartGraph::new(parts.flowchart_id, parts.version, parts.nodes, parts.edges)
    }
}

impl From<FlowchartGraph> for GraphParts {
    fn from(graph: FlowchartGraph) -> Self {
        GraphParts {
            flowchart_id: graph.flowchart_id,
            version: graph.version,
            nodes: graph.nodes.into_values().collect(),
            edges: graph.edges,
        }
    }
}

impl FlowchartGraph {
    pub fn new(
        flowchart_id: FlowchartId,
        version: u64,
        nodes: Vec<FlowchartNode>,
        mut edges: Vec<FlowchartEdge>,
    ) -> Self {
        let nodes = nodes.into_iter().map(|n| (n.id, n)).collect();

        edges.sort_by_key(|e| (e.source_node_id, e.id));
        let mut adjacency: HashMap<NodeId, (usize, usize)> = HashMap::new();
        let mut i = 0;
        while i < edges.len() {
            let start = i;
            let source = edges[i].source_node_id;
            while i < edges.len() && edges[i].source_node_id == source {
                i += 1;
            }
            adjacency.insert(source, (start, i - start));
        }

        Self {
            flowchart_id,
            version,
            nodes,
            edges,
            adjacency,
        }
    }

    pub fn empty(flowchart_id: FlowchartId) -> Self {
        Self::new(flowchart_id, 0, Vec::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The single start node, if the graph has exactly one.
    pub fn start_node(&self) -> Option<&FlowchartNode> {
        let mut starts = self.nodes.values().filter(|n| n.node_type == NodeType::Start);
        match (starts.next(), starts.next()) {
            (Some(start), None) => Some(start),
            _ => None,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&FlowchartNode> {
        self.nodes.get(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&FlowchartEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    pub fn outgoing_edges(&self, node_id: NodeId) -> &[FlowchartEdge] {
        match self.adjacency.get(&node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn outgoing_solid(&self, node_id: NodeId) -> impl Iterator<Item = &FlowchartEdge> {
        self.outgoing_edges(node_id).iter().filter(|e| e.is_solid())
    }

    pub fn incoming_dotted(&self, node_id: NodeId) -> impl Iterator<Item = &FlowchartEdge> {
        self.edges
            .iter()
            .filter(move |e| !e.is_solid() && e.target_node_id == node_id)
    }

    /// Distinct source nodes of the solid edges entering `node_id`.
    pub fn solid_parents(&self, node_id: NodeId) -> BTreeSet<NodeId> {
        self.edges
            .iter()
            .filter(|e| e.is_solid() && e.target_node_id == node_id)
            .map(|e| e.source_node_id)
            .collect()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &FlowchartNode> {
        self.nodes.values()
    }

    pub fn all_edges(&self) -> &[FlowchartEdge] {
        &self.edges
    }

    /// Re-express the graph in the draft form the validator consumes.
    pub fn to_drafts(&self) -> (Vec<NodeDraft>, Vec<EdgeDraft>) {
        let nodes = self.nodes.values().map(FlowchartNode::to_draft).collect();
        let mut edges: Vec<_> = self.edges.iter().collect();
        edges.sort_by_key(|e| e.id);
        (nodes, edges.into_iter().map(FlowchartEdge::to_draft).collect())
    }
}
