use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use personaflow_core::error::Result;
use personaflow_core::event::EventBus;
use personaflow_core::types::{NodeId, NodeResult, NodeStatus, PipelineEvent};

use crate::graph::PipelineGraph;

/// What the runner needs from whoever owns the graph.
///
/// The runner never holds the graph itself: it reads a fresh snapshot at
/// every resolution step and reports changes through these callbacks.
pub trait PipelineHost: Send + Sync {
    /// A copy of the graph as it is right now.
    fn snapshot(&self) -> PipelineGraph;

    fn node_status_changed(&self, id: &NodeId, status: NodeStatus);

    fn node_output_ready(&self, id: &NodeId, result: NodeResult);

    /// Run-level notifications. Ignored by default.
    fn run_event(&self, event: PipelineEvent) {
        let _ = event;
    }
}

/// In-memory graph shared between an editor and the runner.
///
/// Every change is also published on the event bus.
pub struct GraphStore {
    graph: RwLock<PipelineGraph>,
    events: EventBus,
}

impl GraphStore {
    pub fn new(graph: PipelineGraph) -> Self {
        Self::with_events(graph, EventBus::default())
    }

    pub fn with_events(graph: PipelineGraph, events: EventBus) -> Self {
        Self {
            graph: RwLock::new(graph),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Apply an arbitrary edit (add/remove nodes, rewire edges, ...).
    pub fn update<R>(&self, f: impl FnOnce(&mut PipelineGraph) -> R) -> R {
        f(&mut self.write())
    }

    /// Hand-edit a persona's output. Rejected while the node is running.
    pub fn edit_output(&self, id: &NodeId, text: impl Into<String>) -> Result<()> {
        let result = {
            let mut graph = self.write();
            graph.edit_output(id, text)?;
            graph
                .persona(id)
                .map(|p| p.result.clone())
                .unwrap_or_default()
        };
        debug!(node_id = %id, "Output edited by hand");
        self.events.publish(PipelineEvent::NodeOutputReady {
            node_id: id.clone(),
            result,
        });
        self.events.publish(PipelineEvent::NodeStatusChanged {
            node_id: id.clone(),
            status: NodeStatus::Completed,
        });
        Ok(())
    }

    /// Replace the input node's text. Allowed at any time.
    pub fn set_input_value(&self, text: impl Into<String>) -> Result<()> {
        self.write().set_input_value(text)
    }

    pub fn into_graph(self) -> PipelineGraph {
        self.graph
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, PipelineGraph> {
        self.graph
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PipelineGraph> {
        self.graph
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PipelineHost for GraphStore {
    fn snapshot(&self) -> PipelineGraph {
        self.read().clone()
    }

    fn node_status_changed(&self, id: &NodeId, status: NodeStatus) {
        if !self.write().set_status(id, status) {
            debug!(node_id = %id, "Status update for missing node ignored");
            return;
        }
        self.events.publish(PipelineEvent::NodeStatusChanged {
            node_id: id.clone(),
            status,
        });
    }

    fn node_output_ready(&self, id: &NodeId, result: NodeResult) {
        if !self.write().set_result(id, result.clone()) {
            debug!(node_id = %id, "Output for missing node ignored");
            return;
        }
        self.events.publish(PipelineEvent::NodeOutputReady {
            node_id: id.clone(),
            result,
        });
    }

    fn run_event(&self, event: PipelineEvent) {
        self.events.publish(event);
    }
}
