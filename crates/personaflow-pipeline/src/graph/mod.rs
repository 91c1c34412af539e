//! The pipeline graph: persona nodes wired into a DAG and seeded by one
//! input node.
//!
//! The graph is plain data. The engine only ever reads cloned snapshots of
//! it and writes back through small patches, so the host can keep editing
//! nodes and edges while a run is in flight.

pub mod edge;
pub mod node;

use serde::{Deserialize, Serialize};

use personaflow_core::error::{FlowError, Result};
use personaflow_core::types::{NodeId, NodeResult, NodeStatus};

pub use edge::Edge;
pub use node::{Node, NodeKind, PersonaNode};

/// Node set plus edge set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Builder: connect `source` to `target`.
    pub fn with_edge(mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Add an edge unless the same one already exists.
    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        let edge = Edge::new(source, target);
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn disconnect(&mut self, source: &NodeId, target: &NodeId) {
        self.edges
            .retain(|e| !(&e.source == source && &e.target == target));
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        self.edges.retain(|e| !e.touches(id));
        Some(self.nodes.remove(pos))
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    pub fn persona(&self, id: &NodeId) -> Option<&PersonaNode> {
        self.node(id).and_then(Node::as_persona)
    }

    /// The input node. Only one is expected; the first one wins.
    pub fn input_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_input())
    }

    /// Persona nodes in insertion order.
    pub fn personas(&self) -> impl Iterator<Item = (&NodeId, &PersonaNode)> {
        self.nodes
            .iter()
            .filter_map(|n| n.as_persona().map(|p| (&n.id, p)))
    }

    /// Edges ending at `id`, in edge order.
    pub fn incoming<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.target == id)
    }

    /// Replace the input node's text.
    pub fn set_input_value(&mut self, text: impl Into<String>) -> Result<()> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.is_input())
            .ok_or(FlowError::NoInputNode)?;
        node.kind = NodeKind::Input { value: text.into() };
        Ok(())
    }

    /// Hand-edit a persona's output. The node becomes `Completed`.
    ///
    /// Rejected while the node is `Running` so an in-flight call can never
    /// clobber the edit.
    pub fn edit_output(&mut self, id: &NodeId, text: impl Into<String>) -> Result<()> {
        let persona = self.persona_mut(id)?;
        if persona.status == NodeStatus::Running {
            return Err(FlowError::NodeBusy(id.to_string()));
        }
        persona.result = NodeResult::edited(text);
        persona.status = NodeStatus::Completed;
        Ok(())
    }

    /// Set a persona's status. Returns false if the node is gone or not a
    /// persona.
    pub fn set_status(&mut self, id: &NodeId, status: NodeStatus) -> bool {
        match self.node_mut(id).and_then(Node::as_persona_mut) {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        }
    }

    /// Set a persona's result. Returns false if the node is gone or not a
    /// persona.
    pub fn set_result(&mut self, id: &NodeId, result: NodeResult) -> bool {
        match self.node_mut(id).and_then(Node::as_persona_mut) {
            Some(p) => {
                p.result = result;
                true
            }
            None => false,
        }
    }

    fn persona_mut(&mut self, id: &NodeId) -> Result<&mut PersonaNode> {
        let node = self
            .node_mut(id)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))?;
        node.as_persona_mut()
            .ok_or_else(|| FlowError::NotAPersona(id.to_string()))
    }
}
