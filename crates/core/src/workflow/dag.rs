use crate::error::EngineError;
use crate::types::{GraphModel, NodeId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// DAG representation of a workflow graph
pub struct WorkflowDag {
    graph: DiGraph<NodeId, ()>,
    node_indices: HashMap<NodeId, NodeIndex>,
    order: Vec<NodeId>,
}

impl WorkflowDag {
    /// Build a DAG from a graph snapshot
    pub fn from_graph(model: &GraphModel) -> Result<Self, EngineError> {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node in &model.nodes {
            let index = graph.add_node(node.id.clone());
            node_indices.insert(node.id.clone(), index);
        }

        // Edge from source to target (source must finish first)
        for edge in &model.edges {
            let source = node_indices.get(&edge.source).ok_or_else(|| {
                EngineError::Graph(format!(
                    "Edge {} references unknown source node {}",
                    edge.id, edge.source
                ))
            })?;
            let target = node_indices.get(&edge.target).ok_or_else(|| {
                EngineError::Graph(format!(
                    "Edge {} references unknown target node {}",
                    edge.id, edge.target
                ))
            })?;
            graph.add_edge(*source, *target, ());
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| {
                EngineError::Graph(format!(
                    "Workflow contains circular dependencies (at node {})",
                    graph[cycle.node_id()]
                ))
            })?
            .into_iter()
            .map(|index| graph[index].clone())
            .collect();

        Ok(Self {
            graph,
            node_indices,
            order,
        })
    }

    /// Node ids in topological order (dependencies first)
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Direct predecessors of a node
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Direct successors of a node
    pub fn successors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    /// Nodes with no predecessors (can start immediately)
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| self.predecessors(id).is_empty())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn neighbors(&self, node_id: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(index) = self.node_indices.get(node_id) else {
            return Vec::new();
        };

        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(*index, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        // Parallel edges between the same pair show up more than once.
        ids.sort();
        ids.dedup();
        ids
    }
}
