use std::path::Path;

use tracing::debug;

use personaflow_core::error::Result;

use crate::graph::PipelineGraph;

/// Load a pipeline snapshot saved as JSON. The contents are not validated.
pub fn load(path: &Path) -> Result<PipelineGraph> {
    let content = std::fs::read_to_string(path)?;
    let graph: PipelineGraph = serde_json::from_str(&content)?;
    debug!(path = %path.display(), nodes = graph.nodes.len(), edges = graph.edges.len(), "Pipeline loaded");
    Ok(graph)
}

/// Save a pipeline snapshot as pretty-printed JSON.
pub fn save(path: &Path, graph: &PipelineGraph) -> Result<()> {
    let json = serde_json::to_string_pretty(graph)?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), "Pipeline saved");
    Ok(())
}
