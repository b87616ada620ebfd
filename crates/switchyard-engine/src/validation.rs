//! Flowchart validation: lint rules and diagnostics.
//!
//! [`validate`] runs every built-in rule, in a fixed order, over a set of node
//! and edge drafts and returns the de-duplicated findings. It never mutates
//! its input, so it is safe to call both before saving a graph and before
//! starting a run. [`validate_or_raise`] turns any finding into
//! [`SwitchyardError::Validation`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use switchyard_types::{Diagnostic, SwitchyardError};

use crate::graph::{EdgeDraft, EdgeMode, FlowchartGraph, NodeDraft, NodeRef, NodeType};
use crate::node_config::{FanInMode, NodeConfig};

// ---------------------------------------------------------------------------
// GraphView: drafts with types, modes and endpoints pre-resolved
// ---------------------------------------------------------------------------

pub(crate) struct GraphView<'a> {
    nodes: &'a [NodeDraft],
    edges: &'a [EdgeDraft],
    types: Vec<Option<NodeType>>,
    configs: Vec<Option<NodeConfig>>,
    modes: Vec<Option<EdgeMode>>,
    index: HashMap<NodeRef, usize>,
}

impl<'a> GraphView<'a> {
    fn new(nodes: &'a [NodeDraft], edges: &'a [EdgeDraft]) -> Self {
        let types: Vec<_> = nodes.iter().map(|n| n.node_type.parse().ok()).collect();
        let configs = nodes
            .iter()
            .zip(&types)
            .map(|(n, t)| t.and_then(|t| NodeConfig::parse(t, &n.config).ok()))
            .collect();
        let modes = edges.iter().map(|e| e.edge_mode.parse().ok()).collect();

        let mut index = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if let Some(id) = node.id {
                index.entry(NodeRef::Id(id)).or_insert(i);
            }
            if let Some(key) = &node.client_key {
                index.entry(NodeRef::Key(key.clone())).or_insert(i);
            }
        }

        Self {
            nodes,
            edges,
            types,
            configs,
            modes,
            index,
        }
    }

    fn resolve(&self, node: &NodeRef) -> Option<usize> {
        self.index.get(node).copied()
    }

    fn label(&self, i: usize) -> String {
        self.nodes[i].label(i)
    }

    fn edge_labels(edge: &EdgeDraft) -> (String, String) {
        (edge.source.to_string(), edge.target.to_string())
    }

    /// Edges whose mode parsed and whose endpoints both resolve.
    fn resolved_edges(&self) -> impl Iterator<Item = (&'a EdgeDraft, EdgeMode, usize, usize)> + '_ {
        self.edges.iter().zip(&self.modes).filter_map(|(edge, mode)| {
            Some((
                edge,
                (*mode)?,
                self.resolve(&edge.source)?,
                self.resolve(&edge.target)?,
            ))
        })
    }

    fn solid_edges(&self) -> impl Iterator<Item = (&'a EdgeDraft, usize, usize)> + '_ {
        self.resolved_edges()
            .filter(|(_, mode, _, _)| *mode == EdgeMode::Solid)
            .map(|(edge, _, s, t)| (edge, s, t))
    }

    fn start_indices(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.types[i] == Some(NodeType::Start))
            .collect()
    }
}

fn trimmed_key(edge: &EdgeDraft) -> Option<&str> {
    edge.condition_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub(crate) trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Node rules
// ---------------------------------------------------------------------------

struct NodeTypeRule;
impl LintRule for NodeTypeRule {
    fn name(&self) -> &str { "node_type" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| graph.types[*i].is_none())
            .map(|(i, n)| {
                Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!("node '{}' has unknown node_type '{}'", graph.label(i), n.node_type),
                )
            })
            .collect()
    }
}

struct NodeIdentityRule;
impl LintRule for NodeIdentityRule {
    fn name(&self) -> &str { "node_identity" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut seen = HashSet::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            if node.id.is_none() && node.client_key.is_none() {
                diags.push(Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!("node {} has neither an id nor a client_key", graph.label(i)),
                ));
            }
            let refs = node
                .id
                .map(NodeRef::Id)
                .into_iter()
                .chain(node.client_key.clone().map(NodeRef::Key));
            for r in refs {
                if !seen.insert(r.clone()) {
                    diags.push(Diagnostic::node(
                        self.name(),
                        r.to_string(),
                        format!("duplicate node identity '{r}'"),
                    ));
                }
            }
        }
        diags
    }
}

struct NodeReferenceRule;
impl LintRule for NodeReferenceRule {
    fn name(&self) -> &str { "node_reference" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            let Some(node_type) = graph.types[i] else { continue };
            match (node_type.reference_kind(), node.ref_id) {
                (None, Some(ref_id)) => diags.push(Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!(
                        "{node_type} node '{}' does not accept a ref_id (got {ref_id})",
                        graph.label(i)
                    ),
                )),
                (Some(kind), None) => diags.push(Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!(
                        "{node_type} node '{}' requires a {kind} ref_id",
                        graph.label(i)
                    ),
                )),
                _ => {}
            }
        }
        diags
    }
}

struct NodeBindingsRule;
impl LintRule for NodeBindingsRule {
    fn name(&self) -> &str { "node_bindings" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            let Some(node_type) = graph.types[i] else { continue };
            let b = &node.bindings;
            let checks = [
                (b.model_id.is_some(), node_type.allows_model(), "a model"),
                (!b.mcp_server_ids.is_empty(), node_type.allows_mcp_servers(), "MCP servers"),
                (!b.script_ids.is_empty(), node_type.allows_scripts(), "scripts"),
                (!b.attachment_ids.is_empty(), node_type.allows_attachments(), "attachments"),
            ];
            for (present, allowed, what) in checks {
                if present && !allowed {
                    diags.push(Diagnostic::node(
                        self.name(),
                        graph.label(i),
                        format!("{node_type} node '{}' cannot bind {what}", graph.label(i)),
                    ));
                }
            }
        }
        diags
    }
}

struct TaskPromptRule;
impl LintRule for TaskPromptRule {
    fn name(&self) -> &str { "task_prompt" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| graph.types[*i] == Some(NodeType::Task))
            .filter(|(_, n)| {
                n.config
                    .get("prompt")
                    .and_then(|p| p.as_str())
                    .map_or(true, |p| p.trim().is_empty())
            })
            .map(|(i, _)| {
                Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!("task node '{}' requires a non-empty prompt", graph.label(i)),
                )
            })
            .collect()
    }
}

struct NodeConfigRule;
impl LintRule for NodeConfigRule {
    fn name(&self) -> &str { "node_config" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            let Some(node_type) = graph.types[i] else { continue };
            if let Err(errors) = NodeConfig::parse(node_type, &node.config) {
                diags.extend(errors.into_iter().map(|e| {
                    Diagnostic::node(
                        self.name(),
                        graph.label(i),
                        format!("node '{}' config: {e}", graph.label(i)),
                    )
                }));
            }
        }
        diags
    }
}

struct StartNodeRule;
impl LintRule for StartNodeRule {
    fn name(&self) -> &str { "start_node" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let count = graph.start_indices().len();
        if count == 1 {
            return vec![];
        }
        vec![Diagnostic::graph(
            self.name(),
            format!("expected exactly one start node, found {count}"),
        )]
    }
}

// ---------------------------------------------------------------------------
// Edge rules
// ---------------------------------------------------------------------------

struct EdgeEndpointsRule;
impl LintRule for EdgeEndpointsRule {
    fn name(&self) -> &str { "edge_endpoints" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for edge in graph.edges {
            let (src, tgt) = GraphView::edge_labels(edge);
            for (end, r) in [("source", &edge.source), ("target", &edge.target)] {
                if graph.resolve(r).is_none() {
                    diags.push(Diagnostic::edge(
                        self.name(),
                        src.clone(),
                        tgt.clone(),
                        format!("edge {src} -> {tgt} references unknown {end} node '{r}'"),
                    ));
                }
            }
        }
        diags
    }
}

struct EdgeModeRule;
impl LintRule for EdgeModeRule {
    fn name(&self) -> &str { "edge_mode" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        graph
            .edges
            .iter()
            .zip(&graph.modes)
            .filter(|(_, mode)| mode.is_none())
            .map(|(edge, _)| {
                let (src, tgt) = GraphView::edge_labels(edge);
                Diagnostic::edge(
                    self.name(),
                    src.clone(),
                    tgt.clone(),
                    format!(
                        "edge {src} -> {tgt} has unknown edge_mode '{}'",
                        edge.edge_mode
                    ),
                )
            })
            .collect()
    }
}

struct ConditionKeyRule;
impl LintRule for ConditionKeyRule {
    fn name(&self) -> &str { "condition_key" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut seen: HashSet<(usize, &str)> = HashSet::new();
        for (edge, mode, s, _) in graph.resolved_edges() {
            let (src, tgt) = GraphView::edge_labels(edge);
            let key = trimmed_key(edge);
            let is_decision = graph.types[s] == Some(NodeType::Decision);
            let message = match (mode, is_decision, key) {
                (EdgeMode::Dotted, _, Some(_)) => {
                    Some(format!("dotted edge {src} -> {tgt} cannot carry a condition_key"))
                }
                (EdgeMode::Solid, true, None) => Some(format!(
                    "solid edge {src} -> {tgt} leaving decision node requires a condition_key"
                )),
                (EdgeMode::Solid, true, Some(k)) if !seen.insert((s, k)) => Some(format!(
                    "decision node '{}' has duplicate condition_key '{k}'",
                    graph.label(s)
                )),
                (EdgeMode::Solid, false, Some(_)) => Some(format!(
                    "solid edge {src} -> {tgt} cannot carry a condition_key; only decision nodes route by key"
                )),
                _ => None,
            };
            if let Some(message) = message {
                diags.push(Diagnostic::edge(self.name(), src, tgt, message));
            }
        }
        diags
    }
}

struct DecisionFallbackRule;
impl LintRule for DecisionFallbackRule {
    fn name(&self) -> &str { "decision_fallback" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (i, cfg) in graph.configs.iter().enumerate() {
            let Some(fallback) = cfg.as_ref().and_then(|c| c.decision()).and_then(|d| d.fallback_key())
            else {
                continue;
            };
            let matched = graph
                .solid_edges()
                .any(|(edge, s, _)| s == i && trimmed_key(edge) == Some(fallback));
            if !matched {
                diags.push(Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!(
                        "decision node '{}' fallback_condition_key '{fallback}' matches none of its solid edges",
                        graph.label(i)
                    ),
                ));
            }
        }
        diags
    }
}

struct FanOutRule;
impl LintRule for FanOutRule {
    fn name(&self) -> &str { "fan_out" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for (_, s, _) in graph.solid_edges() {
            *counts.entry(s).or_default() += 1;
        }
        counts
            .into_iter()
            .filter_map(|(i, count)| {
                let node_type = graph.types[i]?;
                let max = node_type.max_solid_outgoing();
                (count > max).then(|| {
                    Diagnostic::node(
                        self.name(),
                        graph.label(i),
                        format!(
                            "{node_type} node '{}' has {count} solid outgoing edges; at most {max} allowed",
                            graph.label(i)
                        ),
                    )
                })
            })
            .collect()
    }
}

struct FanInRule;
impl LintRule for FanInRule {
    fn name(&self) -> &str { "fan_in" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut parents: HashMap<usize, HashSet<usize>> = HashMap::new();
        for (_, s, t) in graph.solid_edges() {
            parents.entry(t).or_default().insert(s);
        }
        let mut diags = Vec::new();
        for (i, cfg) in graph.configs.iter().enumerate() {
            let Some(FanInMode::Custom(n)) = cfg.as_ref().map(NodeConfig::fan_in) else {
                continue;
            };
            let available = parents.get(&i).map_or(0, HashSet::len);
            if n as usize > available {
                diags.push(Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!(
                        "node '{}' fan_in_custom_count {n} exceeds its {available} distinct solid parents",
                        graph.label(i)
                    ),
                ));
            }
        }
        diags
    }
}

struct EdgeExclusivityRule;
impl LintRule for EdgeExclusivityRule {
    fn name(&self) -> &str { "edge_exclusivity" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let mut modes: BTreeMap<(usize, usize), (bool, bool)> = BTreeMap::new();
        for (_, mode, s, t) in graph.resolved_edges() {
            let entry = modes.entry((s, t)).or_default();
            match mode {
                EdgeMode::Solid => entry.0 = true,
                EdgeMode::Dotted => entry.1 = true,
            }
        }
        modes
            .into_iter()
            .filter(|(_, (solid, dotted))| *solid && *dotted)
            .map(|((s, t), _)| {
                let (src, tgt) = (graph.label(s), graph.label(t));
                Diagnostic::edge(
                    self.name(),
                    src.clone(),
                    tgt.clone(),
                    format!("nodes {src} -> {tgt} are joined by both a solid and a dotted edge"),
                )
            })
            .collect()
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, graph: &GraphView<'_>) -> Vec<Diagnostic> {
        let starts = graph.start_indices();
        let [start] = starts.as_slice() else {
            return vec![]; // StartNodeRule reports this
        };

        let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
        for (_, s, t) in graph.solid_edges() {
            children.entry(s).or_default().push(t);
        }

        let mut visited = HashSet::from([*start]);
        let mut queue = VecDeque::from([*start]);
        while let Some(current) = queue.pop_front() {
            for &next in children.get(&current).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        (0..graph.nodes.len())
            .filter(|i| !visited.contains(i))
            .map(|i| {
                Diagnostic::node(
                    self.name(),
                    graph.label(i),
                    format!("node '{}' is not reachable from the start node", graph.label(i)),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run every lint rule and return the de-duplicated diagnostics in rule order.
pub fn validate(nodes: &[NodeDraft], edges: &[EdgeDraft]) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NodeTypeRule),
        Box::new(NodeIdentityRule),
        Box::new(NodeReferenceRule),
        Box::new(NodeBindingsRule),
        Box::new(TaskPromptRule),
        Box::new(NodeConfigRule),
        Box::new(StartNodeRule),
        Box::new(EdgeEndpointsRule),
        Box::new(EdgeModeRule),
        Box::new(ConditionKeyRule),
        Box::new(DecisionFallbackRule),
        Box::new(FanOutRule),
        Box::new(FanInRule),
        Box::new(EdgeExclusivityRule),
        Box::new(ReachabilityRule),
    ];

    let view = GraphView::new(nodes, edges);
    let mut seen = HashSet::new();
    let mut diagnostics = Vec::new();
    for rule in &rules {
        for diag in rule.apply(&view) {
            if seen.insert(diag.clone()) {
                diagnostics.push(diag);
            }
        }
    }
    diagnostics
}

/// Validate a persisted graph.
pub fn validate_graph(graph: &FlowchartGraph) -> Vec<Diagnostic> {
    let (nodes, edges) = graph.to_drafts();
    validate(&nodes, &edges)
}

/// Run all lint rules; return `Err` if anything was found.
pub fn validate_or_raise(nodes: &[NodeDraft], edges: &[EdgeDraft]) -> switchyard_types::Result<()> {
    let diagnostics = validate(nodes, edges);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(SwitchyardError::Validation(diagnostics))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
