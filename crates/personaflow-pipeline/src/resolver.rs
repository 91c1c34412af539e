use std::collections::HashSet;

use personaflow_core::types::NodeId;

use crate::graph::PipelineGraph;

/// Persona nodes whose every predecessor is in `completed`.
///
/// Input nodes are never returned, nor is anything already completed. A
/// persona with no incoming edge has no context source and is never ready;
/// nodes on a cycle never are either. The result has no defined order.
pub fn compute_ready_layer(graph: &PipelineGraph, completed: &HashSet<NodeId>) -> Vec<NodeId> {
    graph
        .personas()
        .filter(|(id, _)| !completed.contains(*id))
        .filter(|(id, _)| {
            let mut incoming = graph.incoming(id).peekable();
            incoming.peek().is_some() && incoming.all(|e| completed.contains(&e.source))
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// Persona nodes that are neither completed nor failed: dead nodes, cycle
/// members, and everything downstream of a failure.
pub fn unresolved_nodes(
    graph: &PipelineGraph,
    completed: &HashSet<NodeId>,
    failed: &HashSet<NodeId>,
) -> Vec<NodeId> {
    graph
        .personas()
        .map(|(id, _)| id)
        .filter(|id| !completed.contains(*id) && !failed.contains(*id))
        .cloned()
        .collect()
}
