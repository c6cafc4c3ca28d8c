//! Graph model, cycle detection, and reachability queries.
//!
//! Uses `petgraph` to model connections as a directed graph. Topological sort
//! rejects cycles (loops live inside loop-style nodes, never in the graph),
//! and DFS over the graph or its reversal answers the descendant/ancestor
//! questions asked by cancel cascades and partial compensation.

use std::collections::{HashMap, HashSet};

use nodeflow_types::definition::{NodeId, WorkflowDefinition};
use nodeflow_types::message::MessageKind;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Directed graph of node ids with one edge per connection.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<NodeId, MessageKind>,
    index: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Build the graph, rejecting connections to unknown nodes.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::<NodeId, MessageKind>::new();
        let mut index = HashMap::new();
        for node in &definition.nodes {
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        for conn in &definition.connections {
            let from = index.get(&conn.source_node_id).ok_or_else(|| {
                WorkflowError::UnknownNode(format!(
                    "connection source '{}' is not defined",
                    conn.source_node_id
                ))
            })?;
            let to = index.get(&conn.target_node_id).ok_or_else(|| {
                WorkflowError::UnknownNode(format!(
                    "connection target '{}' is not defined",
                    conn.target_node_id
                ))
            })?;
            graph.add_edge(*from, *to, conn.trigger);
        }

        Ok(Self { graph, index })
    }

    /// Topological order of node ids, or `CycleDetected`.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, WorkflowError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let node_id = &self.graph[cycle.node_id()];
            WorkflowError::CycleDetected(format!("cycle detected involving node '{node_id}'"))
        })?;
        Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
    }

    /// Every node reachable from `node_id`, excluding itself.
    pub fn descendants(&self, node_id: &str) -> HashSet<NodeId> {
        let Some(&start) = self.index.get(node_id) else {
            return HashSet::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = HashSet::new();
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                found.insert(self.graph[idx].clone());
            }
        }
        found
    }

    /// Every node from which `node_id` is reachable, excluding itself.
    pub fn ancestors(&self, node_id: &str) -> HashSet<NodeId> {
        let Some(&start) = self.index.get(node_id) else {
            return HashSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = HashSet::new();
        while let Some(idx) = dfs.next(reversed) {
            if idx != start {
                found.insert(self.graph[idx].clone());
            }
        }
        found
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Nodes seeded when an instance starts.
///
/// The explicit `entry_point` wins. Otherwise every node without inbound
/// connections is an entry point, except nodes that only serve as
/// compensation or fallback handlers.
pub fn entry_points(definition: &WorkflowDefinition) -> Vec<NodeId> {
    if let Some(entry) = &definition.entry_point {
        return vec![entry.clone()];
    }

    let handlers: HashSet<&str> = definition
        .nodes
        .iter()
        .flat_map(|n| {
            n.compensation_node_id
                .iter()
                .chain(n.fallback_node_id.iter())
                .map(String::as_str)
        })
        .collect();
    let targets: HashSet<&str> = definition
        .connections
        .iter()
        .map(|c| c.target_node_id.as_str())
        .collect();

    definition
        .nodes
        .iter()
        .filter(|n| !targets.contains(n.id.as_str()) && !handlers.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect()
}
