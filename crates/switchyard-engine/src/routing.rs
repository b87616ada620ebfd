//! Edge selection and fan-in gating.
//!
//! After a node run finishes, [`next_edges`] picks the solid edges to follow
//! and [`plan_activations`] turns them into activations, holding back any
//! target that still waits on other parents of its fan-in lineage.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use switchyard_types::NodeId;

use crate::graph::{FlowchartEdge, FlowchartGraph, FlowchartNode, NodeType};
use crate::node_config::FanInMode;
use crate::run::{Activation, FlowchartRunNode, TriggerSource};

/// The edge a decision took.
#[derive(Debug, Clone, Copy)]
pub struct RouteSelection<'a> {
    pub edge: &'a FlowchartEdge,
    pub fallback_applied: bool,
}

fn edge_key(edge: &FlowchartEdge) -> Option<&str> {
    edge.condition_key.as_deref().map(str::trim)
}

/// Match a decision's route key against its solid edges, applying the
/// node's no-match policy when nothing matches.
pub fn route_decision<'a>(
    graph: &'a FlowchartGraph,
    node: &FlowchartNode,
    route_key: Option<&str>,
) -> Result<RouteSelection<'a>, String> {
    let key = route_key.map(str::trim).filter(|k| !k.is_empty());
    let mut solid = graph.outgoing_solid(node.id);

    if let Some(key) = key {
        if let Some(edge) = solid.find(|e| edge_key(e) == Some(key)) {
            return Ok(RouteSelection {
                edge,
                fallback_applied: false,
            });
        }
    }

    let fallback = node.config.decision().and_then(|d| d.fallback_key());
    if let Some(fallback) = fallback {
        if let Some(edge) = graph
            .outgoing_solid(node.id)
            .find(|e| edge_key(e) == Some(fallback))
        {
            return Ok(RouteSelection {
                edge,
                fallback_applied: true,
            });
        }
    }

    let known: Vec<&str> = graph.outgoing_solid(node.id).filter_map(edge_key).collect();
    Err(format!(
        "decision node '{}' produced route key '{}' matching none of [{}]",
        node.id,
        key.unwrap_or(""),
        known.join(", ")
    ))
}

/// Solid edges to follow out of `node`.
///
/// `lenient` is used for skipped or degraded executions: a decision that
/// cannot be routed simply ends its branch instead of failing.
pub fn next_edges<'a>(
    graph: &'a FlowchartGraph,
    node: &FlowchartNode,
    route_key: Option<&str>,
    lenient: bool,
) -> Result<(Vec<&'a FlowchartEdge>, bool), String> {
    if node.node_type != NodeType::Decision {
        return Ok((graph.outgoing_solid(node.id).collect(), false));
    }
    match route_decision(graph, node, route_key) {
        Ok(selection) => Ok((vec![selection.edge], selection.fallback_applied)),
        Err(_) if lenient => Ok((vec![], false)),
        Err(message) => Err(message),
    }
}

// ---------------------------------------------------------------------------
// Fan-in lineages
// ---------------------------------------------------------------------------

/// Arrivals at a multi-parent node within the current lineage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanInWave {
    arrived: BTreeMap<NodeId, TriggerSource>,
    fired: bool,
}

impl FanInWave {
    /// Record one parent's arrival. Returns the trigger sources to activate
    /// with when this arrival makes the node eligible.
    pub fn arrive(
        &mut self,
        trigger: TriggerSource,
        mode: FanInMode,
        parents: &BTreeSet<NodeId>,
    ) -> Option<Vec<TriggerSource>> {
        if self.arrived.contains_key(&trigger.source_node_id) {
            *self = FanInWave::default();
        }
        self.arrived.insert(trigger.source_node_id, trigger);

        let needed = match mode {
            FanInMode::All => parents.len(),
            FanInMode::Any => 1,
            FanInMode::Custom(n) => (n as usize).min(parents.len()),
        };

        let mut fire = None;
        if !self.fired && self.arrived.len() >= needed {
            self.fired = true;
            fire = Some(self.arrived.values().cloned().collect());
        }
        if self.arrived.len() >= parents.len() {
            *self = FanInWave::default();
        }
        fire
    }

    pub fn arrivals(&self) -> usize {
        self.arrived.len()
    }
}

/// Turn the chosen edges out of `source` into activations, gating
/// multi-parent targets through their fan-in lineage.
pub fn plan_activations(
    graph: &FlowchartGraph,
    fan_in: &mut BTreeMap<NodeId, FanInWave>,
    source: &FlowchartRunNode,
    edges: &[&FlowchartEdge],
) -> Vec<Activation> {
    let mut activations = Vec::new();
    for edge in edges {
        let Some(target) = graph.node(edge.target_node_id) else {
            continue;
        };
        let trigger = source.as_trigger(Some(edge.id), edge.condition_key.clone());
        let parents = graph.solid_parents(target.id);
        if parents.len() <= 1 {
            activations.push(Activation::new(target.id, vec![trigger]));
            continue;
        }
        let wave = fan_in.entry(target.id).or_default();
        if let Some(triggers) = wave.arrive(trigger, target.config.fan_in(), &parents) {
            activations.push(Activation::new(target.id, triggers));
        }
    }
    activations
}
