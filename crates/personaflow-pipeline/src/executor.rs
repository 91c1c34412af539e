use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use personaflow_core::config::{ModelConfig, PipelineConfig};
use personaflow_core::error::FlowError;
use personaflow_core::traits::ModelClient;
use personaflow_core::types::NodeId;

use crate::graph::{NodeKind, PipelineGraph};

/// One upstream source as seen by a downstream prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamContext {
    pub label: String,
    pub text: String,
}

impl UpstreamContext {
    pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
        }
    }
}

/// A single node's model call failed.
#[derive(Debug, Error)]
#[error("node '{node_id}' failed: {source}")]
pub struct ExecutionError {
    pub node_id: NodeId,
    #[source]
    pub source: FlowError,
}

/// Collect the context blocks for `target`, one per incoming edge, in edge
/// order.
///
/// Persona sources contribute their current output. The input node
/// contributes `input_text` when given (a run's start-of-run snapshot),
/// otherwise its live value. Edges from nodes that no longer exist are
/// skipped.
pub fn gather_upstream(
    graph: &PipelineGraph,
    target: &NodeId,
    input_text: Option<&str>,
    config: &PipelineConfig,
) -> Vec<UpstreamContext> {
    graph
        .incoming(target)
        .filter_map(|edge| graph.node(&edge.source))
        .map(|source| match &source.kind {
            NodeKind::Input { value } => {
                UpstreamContext::new(&config.input_label, input_text.unwrap_or(value))
            }
            NodeKind::Persona(p) => UpstreamContext::new(&p.label, p.output()),
        })
        .collect()
}

/// Render the single prompt sent for a persona node.
pub fn render_prompt(
    instruction: &str,
    upstream: &[UpstreamContext],
    empty_placeholder: &str,
) -> String {
    let mut prompt = instruction.trim().to_string();

    if !upstream.is_empty() {
        prompt.push_str("\n\n## Context\n");
        for ctx in upstream {
            let text = if ctx.text.trim().is_empty() {
                empty_placeholder
            } else {
                ctx.text.trim()
            };
            prompt.push_str(&format!(
                "\n--- BEGIN {label} ---\n{text}\n--- END {label} ---\n",
                label = ctx.label,
                text = text
            ));
        }
    }

    prompt
}

/// Runs one persona node against the model. Never touches the graph.
pub struct NodeExecutor {
    client: Arc<dyn ModelClient>,
    model: ModelConfig,
    pipeline: PipelineConfig,
}

impl NodeExecutor {
    pub fn new(client: Arc<dyn ModelClient>, model: ModelConfig, pipeline: PipelineConfig) -> Self {
        Self {
            client,
            model,
            pipeline,
        }
    }

    pub fn pipeline_config(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Render the prompt, call the model once, and return the trimmed text.
    ///
    /// A blank response counts as malformed.
    pub async fn execute_node(
        &self,
        node_id: &NodeId,
        instruction: &str,
        upstream: &[UpstreamContext],
    ) -> Result<String, ExecutionError> {
        let prompt = render_prompt(instruction, upstream, &self.pipeline.empty_placeholder);
        let start = Instant::now();

        debug!(node_id = %node_id, sources = upstream.len(), prompt_len = prompt.len(), "Calling model");

        let generation = self
            .client
            .generate(&self.model, prompt)
            .await
            .map_err(|source| ExecutionError {
                node_id: node_id.clone(),
                source,
            })?;

        let text = generation.text.trim();
        if text.is_empty() {
            return Err(ExecutionError {
                node_id: node_id.clone(),
                source: FlowError::ModelResponse("empty response".into()),
            });
        }

        info!(
            node_id = %node_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            output_tokens = generation.output_tokens,
            "Node executed"
        );

        Ok(text.to_string())
    }
}
