use serde::{Deserialize, Serialize};

use personaflow_core::types::{NodeId, NodeResult, NodeStatus};

/// A node in the pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// What a node does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Raw seed text typed by the user. Never executed.
    Input {
        #[serde(default)]
        value: String,
    },
    /// Applies a persona's instruction text to its upstream context.
    Persona(PersonaNode),
}

/// Mutable state of a persona node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaNode {
    /// Display name, also used to label this node's output downstream.
    pub label: String,
    /// The persona's system prompt.
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub result: NodeResult,
}

impl PersonaNode {
    /// The visible output text.
    pub fn output(&self) -> &str {
        self.result.text()
    }
}

impl Node {
    /// Create an input node.
    pub fn input(id: impl Into<NodeId>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Input {
                value: value.into(),
            },
        }
    }

    /// Create an idle persona node with no instruction.
    pub fn persona(id: impl Into<NodeId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Persona(PersonaNode {
                label: label.into(),
                ..Default::default()
            }),
        }
    }

    /// Set the persona instruction text. No-op on input nodes.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        if let NodeKind::Persona(p) = &mut self.kind {
            p.instruction = instruction.into();
        }
        self
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input { .. })
    }

    pub fn as_persona(&self) -> Option<&PersonaNode> {
        match &self.kind {
            NodeKind::Persona(p) => Some(p),
            NodeKind::Input { .. } => None,
        }
    }

    pub fn as_persona_mut(&mut self) -> Option<&mut PersonaNode> {
        match &mut self.kind {
            NodeKind::Persona(p) => Some(p),
            NodeKind::Input { .. } => None,
        }
    }

    /// Status for display; input nodes are always idle.
    pub fn status(&self) -> NodeStatus {
        self.as_persona().map(|p| p.status).unwrap_or_default()
    }
}
