use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique pipeline node identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a persona node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Where a resolved output came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrigin {
    /// Produced by a model call.
    Executed,
    /// Typed in by a human.
    ManuallyEdited,
}

/// The output held by a persona node, tagged with its provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeResult {
    #[default]
    Unresolved,
    Resolved { text: String, origin: ResultOrigin },
    Failed { cause: String },
}

impl NodeResult {
    pub fn executed(text: impl Into<String>) -> Self {
        Self::Resolved {
            text: text.into(),
            origin: ResultOrigin::Executed,
        }
    }

    pub fn edited(text: impl Into<String>) -> Self {
        Self::Resolved {
            text: text.into(),
            origin: ResultOrigin::ManuallyEdited,
        }
    }

    pub fn failed(cause: impl Into<String>) -> Self {
        Self::Failed {
            cause: cause.into(),
        }
    }

    /// The visible output text; empty unless resolved.
    pub fn text(&self) -> &str {
        match self {
            Self::Resolved { text, .. } => text,
            _ => "",
        }
    }

    pub fn origin(&self) -> Option<ResultOrigin> {
        match self {
            Self::Resolved { origin, .. } => Some(*origin),
            _ => None,
        }
    }
}

/// Terminal state of one full pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
    /// Another run was already active; nothing was done.
    Ignored,
}

/// A finished model call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A streaming delta from the model.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Stop reason from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    Safety,
}

/// Pipeline event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A full run started.
    RunStarted { run_id: String, at: DateTime<Utc> },
    /// A ready layer was dispatched.
    LayerStarted { run_id: String, nodes: Vec<NodeId> },
    /// A node changed status.
    NodeStatusChanged { node_id: NodeId, status: NodeStatus },
    /// A node's result was written.
    NodeOutputReady { node_id: NodeId, result: NodeResult },
    /// A full run finished.
    RunFinished {
        run_id: String,
        status: RunStatus,
        at: DateTime<Utc>,
    },
}
