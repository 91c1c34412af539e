use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use personaflow_core::config::{ModelConfig, PipelineConfig};
use personaflow_core::error::{FlowError, Result};
use personaflow_core::traits::ModelClient;
use personaflow_core::types::{NodeId, NodeResult, NodeStatus, PipelineEvent, RunStatus};

use crate::executor::{gather_upstream, NodeExecutor};
use crate::graph::NodeKind;
use crate::resolver::{compute_ready_layer, unresolved_nodes};
use crate::store::PipelineHost;

/// Bookkeeping for one full run.
#[derive(Debug, Default)]
struct RunState {
    /// Nodes whose output is final for this run (the input node included).
    completed: HashSet<NodeId>,
    /// Nodes that errored this run. Never retried, never satisfy a dependency.
    failed: HashSet<NodeId>,
    /// The input node's text as it was when the run started.
    input_text: Option<String>,
}

/// Summary of a full run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    /// Persona nodes that completed, in completion order.
    pub completed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    /// Persona nodes that never ran: no predecessors, on a cycle, downstream
    /// of a failure, or cut off by cancellation.
    pub unresolved: Vec<NodeId>,
    pub layers: usize,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn ignored() -> Self {
        Self {
            run_id: String::new(),
            status: RunStatus::Ignored,
            completed: Vec::new(),
            failed: Vec::new(),
            unresolved: Vec::new(),
            layers: 0,
            elapsed_ms: 0,
        }
    }
}

/// Clears the active-run slot when a run ends, however it ends.
struct ActiveRun<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

/// Drives a pipeline graph layer by layer.
///
/// At most one full run is active per runner. Single-node runs ignore that
/// limit and may overlap a full run.
pub struct PipelineRunner {
    executor: NodeExecutor,
    active: Mutex<Option<CancellationToken>>,
}

impl PipelineRunner {
    pub fn new(client: Arc<dyn ModelClient>, model: ModelConfig, pipeline: PipelineConfig) -> Self {
        Self::from_executor(NodeExecutor::new(client, model, pipeline))
    }

    pub fn from_executor(executor: NodeExecutor) -> Self {
        Self {
            executor,
            active: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Ask the active full run to stop. Returns false if nothing is running.
    ///
    /// The run stops at once: calls still in flight are dropped, their nodes
    /// go back to `Idle`, and no further layer starts.
    pub fn cancel(&self) -> bool {
        match self.active.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(token) => {
                info!("Pipeline run cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim the active-run slot, or `None` if a run already holds it.
    fn begin(&self) -> Option<CancellationToken> {
        let mut slot = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Some(token)
    }

    /// Run every reachable persona node, layer by layer.
    pub async fn run_all<H: PipelineHost + ?Sized>(&self, host: &H) -> RunReport {
        let Some(cancel) = self.begin() else {
            warn!("Pipeline run already active, ignoring new run request");
            return RunReport::ignored();
        };
        let _active = ActiveRun { slot: &self.active };

        let run_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        host.run_event(PipelineEvent::RunStarted {
            run_id: run_id.clone(),
            at: Utc::now(),
        });

        let mut state = RunState::default();
        let graph = host.snapshot();
        if let Some(input) = graph.input_node() {
            if let NodeKind::Input { value } = &input.kind {
                state.input_text = Some(value.clone());
            }
            state.completed.insert(input.id.clone());
        } else {
            debug!("Pipeline has no input node");
        }
        for (id, persona) in graph.personas() {
            if persona.status != NodeStatus::Idle {
                host.node_status_changed(id, NodeStatus::Idle);
            }
        }

        info!(run_id = %run_id, nodes = graph.nodes.len(), edges = graph.edges.len(), "Pipeline run started");

        let mut completed_order = Vec::new();
        let mut layers = 0;
        let status = loop {
            if cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }

            let graph = host.snapshot();
            let mut layer = compute_ready_layer(&graph, &state.completed);
            layer.retain(|id| !state.failed.contains(id));
            if layer.is_empty() {
                break RunStatus::Completed;
            }

            layers += 1;
            debug!(run_id = %run_id, layer = layers, width = layer.len(), "Dispatching ready layer");
            host.run_event(PipelineEvent::LayerStarted {
                run_id: run_id.clone(),
                nodes: layer.clone(),
            });

            let mut in_flight = HashSet::new();
            let mut pending = FuturesUnordered::new();
            for id in layer {
                let Some(persona) = graph.persona(&id) else {
                    continue;
                };
                let upstream = gather_upstream(
                    &graph,
                    &id,
                    state.input_text.as_deref(),
                    self.executor.pipeline_config(),
                );
                let instruction = persona.instruction.clone();
                host.node_status_changed(&id, NodeStatus::Running);
                in_flight.insert(id.clone());

                let executor = &self.executor;
                pending.push(async move {
                    let outcome = executor.execute_node(&id, &instruction, &upstream).await;
                    (id, outcome)
                });
            }

            let mut cancelled = false;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    next = pending.next() => match next {
                        Some((id, Ok(text))) => {
                            in_flight.remove(&id);
                            host.node_output_ready(&id, NodeResult::executed(text));
                            host.node_status_changed(&id, NodeStatus::Completed);
                            completed_order.push(id.clone());
                            state.completed.insert(id);
                        }
                        Some((id, Err(e))) => {
                            in_flight.remove(&id);
                            warn!(node_id = %id, error = %e.source, "Pipeline node failed");
                            host.node_output_ready(&id, NodeResult::failed(e.source.to_string()));
                            host.node_status_changed(&id, NodeStatus::Error);
                            state.failed.insert(id);
                        }
                        None => break,
                    },
                }
            }

            if cancelled {
                // Dropping the futures aborts the underlying requests.
                drop(pending);
                for id in &in_flight {
                    host.node_status_changed(id, NodeStatus::Idle);
                }
                debug!(run_id = %run_id, abandoned = in_flight.len(), "In-flight calls dropped");
                break RunStatus::Cancelled;
            }
        };

        let final_graph = host.snapshot();
        let report = RunReport {
            run_id: run_id.clone(),
            status,
            completed: completed_order,
            failed: state.failed.iter().cloned().collect(),
            unresolved: unresolved_nodes(&final_graph, &state.completed, &state.failed),
            layers,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            run_id = %run_id,
            status = ?report.status,
            completed = report.completed.len(),
            failed = report.failed.len(),
            unresolved = report.unresolved.len(),
            elapsed_ms = report.elapsed_ms,
            "Pipeline run finished"
        );
        host.run_event(PipelineEvent::RunFinished {
            run_id,
            status,
            at: Utc::now(),
        });

        report
    }

    /// Run exactly one persona node with whatever its sources hold right now.
    ///
    /// Works whether or not a full run is active and touches no other node.
    /// A model failure is reported as `NodeResult::Failed`, not as `Err`.
    pub async fn run_node<H: PipelineHost + ?Sized>(&self, host: &H, id: &NodeId) -> Result<NodeResult> {
        let graph = host.snapshot();
        let node = graph
            .node(id)
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))?;
        let persona = node
            .as_persona()
            .ok_or_else(|| FlowError::NotAPersona(id.to_string()))?;

        let upstream = gather_upstream(&graph, id, None, self.executor.pipeline_config());
        info!(node_id = %id, sources = upstream.len(), "Running single node");

        host.node_status_changed(id, NodeStatus::Running);
        let (result, status) = match self
            .executor
            .execute_node(id, &persona.instruction, &upstream)
            .await
        {
            Ok(text) => (NodeResult::executed(text), NodeStatus::Completed),
            Err(e) => {
                warn!(node_id = %id, error = %e.source, "Single node run failed");
                (NodeResult::failed(e.source.to_string()), NodeStatus::Error)
            }
        };
        host.node_output_ready(id, result.clone());
        host.node_status_changed(id, status);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use personaflow_core::types::ResultOrigin;
    use personaflow_test_utils::{test_model_config, test_pipeline_config, ScriptedModel};

    use crate::graph::{Node, PipelineGraph};
    use crate::store::GraphStore;

    fn runner(model: &Arc<ScriptedModel>) -> PipelineRunner {
        PipelineRunner::new(model.clone(), test_model_config(), test_pipeline_config())
    }

    fn chain() -> PipelineGraph {
        PipelineGraph::new()
            .with_node(Node::input("in", "the sea"))
            .with_node(Node::persona("a", "Poet").with_instruction("POET: write a poem."))
            .with_node(Node::persona("b", "Critic").with_instruction("CRITIC: review it."))
            .with_edge("in", "a")
            .with_edge("a", "b")
    }

    fn status(store: &GraphStore, id: &str) -> NodeStatus {
        store.snapshot().persona(&id.into()).unwrap().status
    }

    fn output(store: &GraphStore, id: &str) -> String {
        store.snapshot().persona(&id.into()).unwrap().output().to_string()
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let model = Arc::new(
            ScriptedModel::new()
                .reply_when("POET", "Waves of salt")
                .reply_when("CRITIC", "Too short"),
        );
        let store = GraphStore::new(chain());
        let report = runner(&model).run_all(&store).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.layers, 2);
        let order: Vec<_> = report.completed.iter().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert!(report.failed.is_empty());
        assert!(report.unresolved.is_empty());

        assert_eq!(status(&store, "a"), NodeStatus::Completed);
        assert_eq!(status(&store, "b"), NodeStatus::Completed);
        assert_eq!(output(&store, "b"), "Too short");

        let critic_prompt = model.prompts_containing("CRITIC")[0].clone();
        assert!(critic_prompt.contains("--- BEGIN Poet ---\nWaves of salt"));
        let poet_prompt = model.prompts_containing("POET")[0].clone();
        assert!(poet_prompt.contains("--- BEGIN User Input ---\nthe sea"));
    }

    #[tokio::test]
    async fn test_failure_blocks_downstream_only() {
        let model = Arc::new(ScriptedModel::new().fail_when("POET", "HTTP 503"));
        let graph = chain()
            .with_node(Node::persona("side", "Side").with_instruction("SIDE"))
            .with_edge("in", "side");
        let store = GraphStore::new(graph);
        let report = runner(&model).run_all(&store).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.failed, vec![NodeId::from("a")]);
        assert_eq!(report.completed, vec![NodeId::from("side")]);
        assert_eq!(report.unresolved, vec![NodeId::from("b")]);

        assert_eq!(status(&store, "a"), NodeStatus::Error);
        assert_eq!(status(&store, "b"), NodeStatus::Idle);
        assert_eq!(status(&store, "side"), NodeStatus::Completed);
        let snap = store.snapshot();
        assert!(matches!(
            snap.persona(&"a".into()).unwrap().result,
            NodeResult::Failed { ref cause } if cause.contains("HTTP 503")
        ));
        // The failed node is not retried.
        assert_eq!(model.prompts_containing("POET").len(), 1);
        assert!(model.prompts_containing("CRITIC").is_empty());
    }

    #[tokio::test]
    async fn test_cycle_terminates_untouched() {
        let graph = PipelineGraph::new()
            .with_node(Node::input("in", "x"))
            .with_node(Node::persona("a", "A"))
            .with_node(Node::persona("b", "B"))
            .with_edge("a", "b")
            .with_edge("b", "a");
        let model = Arc::new(ScriptedModel::new());
        let store = GraphStore::new(graph);
        let report = runner(&model).run_all(&store).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.layers, 0);
        assert_eq!(report.unresolved.len(), 2);
        assert_eq!(status(&store, "a"), NodeStatus::Idle);
        assert_eq!(status(&store, "b"), NodeStatus::Idle);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_node_left_running_on_dag() {
        // in -> a, in -> b, a+b -> c, c -> d, orphan
        let graph = PipelineGraph::new()
            .with_node(Node::input("in", "x"))
            .with_node(Node::persona("a", "A").with_instruction("A"))
            .with_node(Node::persona("b", "B").with_instruction("B-fail"))
            .with_node(Node::persona("c", "C").with_instruction("C"))
            .with_node(Node::persona("d", "D").with_instruction("D"))
            .with_node(Node::persona("orphan", "O"))
            .with_edge("in", "a")
            .with_edge("in", "b")
            .with_edge("a", "c")
            .with_edge("in", "c")
            .with_edge("c", "d");
        let model = Arc::new(
            ScriptedModel::new()
                .fail_when("B-fail", "boom")
                .with_delay(Duration::from_millis(5)),
        );
        let store = GraphStore::new(graph);
        let report = runner(&model).run_all(&store).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.layers, 3);
        for (_, persona) in store.snapshot().personas() {
            assert_ne!(persona.status, NodeStatus::Running);
        }
        assert_eq!(status(&store, "d"), NodeStatus::Completed);
        assert_eq!(status(&store, "b"), NodeStatus::Error);
        assert_eq!(status(&store, "orphan"), NodeStatus::Idle);
    }

    #[tokio::test]
    async fn test_layer_nodes_run_concurrently() {
        let graph = PipelineGraph::new()
            .with_node(Node::input("in", "x"))
            .with_node(Node::persona("a", "A").with_instruction("A"))
            .with_node(Node::persona("b", "B").with_instruction("B"))
            .with_node(Node::persona("c", "C").with_instruction("C"))
            .with_edge("in", "a")
            .with_edge("in", "b")
            .with_edge("in", "c");
        let model = Arc::new(ScriptedModel::new().with_delay(Duration::from_millis(200)));
        let store = GraphStore::new(graph);

        let start = Instant::now();
        let report = runner(&model).run_all(&store).await;
        assert_eq!(report.completed.len(), 3);
        assert!(start.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_cancel_prevents_next_layer() {
        let model = Arc::new(ScriptedModel::new().hang_when("POET"));
        let store = GraphStore::new(chain());
        let runner = runner(&model);

        let run = runner.run_all(&store);
        let cancel = async {
            model.wait_for_calls(1).await;
            assert!(runner.is_running());
            assert_eq!(status(&store, "a"), NodeStatus::Running);
            assert!(runner.cancel());
        };
        let (report, _) = tokio::join!(run, cancel);

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.layers, 1);
        assert!(report.completed.is_empty());
        assert_eq!(model.call_count(), 1);
        assert!(model.prompts_containing("CRITIC").is_empty());
        assert_eq!(status(&store, "a"), NodeStatus::Idle);
        assert_eq!(status(&store, "b"), NodeStatus::Idle);
        assert!(!runner.is_running());
        assert!(!runner.cancel());
    }

    #[tokio::test]
    async fn test_second_run_is_ignored() {
        let model = Arc::new(ScriptedModel::new().hang_when("POET"));
        let store = GraphStore::new(chain());
        let runner = runner(&model);

        let first = runner.run_all(&store);
        let second = async {
            model.wait_for_calls(1).await;
            let report = runner.run_all(&store).await;
            runner.cancel();
            report
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(second.status, RunStatus::Ignored);
        assert_eq!(first.status, RunStatus::Cancelled);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rerun_resets_status_but_keeps_output() {
        let model = Arc::new(ScriptedModel::new().default_reply("v1"));
        let store = GraphStore::new(chain());
        runner(&model).run_all(&store).await;
        assert_eq!(output(&store, "b"), "v1");

        // Break the chain: b loses its source and must not run again.
        store.update(|g| g.disconnect(&"a".into(), &"b".into()));
        let report = runner(&model).run_all(&store).await;

        assert_eq!(report.unresolved, vec![NodeId::from("b")]);
        assert_eq!(status(&store, "b"), NodeStatus::Idle);
        assert_eq!(output(&store, "b"), "v1");
    }

    #[tokio::test]
    async fn test_input_snapshot_taken_at_run_start() {
        let model = Arc::new(
            ScriptedModel::new()
                .reply_when("POET", "poem")
                .with_delay(Duration::from_millis(20)),
        );
        let store = GraphStore::new(
            chain()
                .with_node(Node::persona("c", "Echo").with_instruction("ECHO"))
                .with_edge("a", "c")
                .with_edge("in", "c"),
        );
        let runner = runner(&model);

        let run = runner.run_all(&store);
        let edit = async {
            model.wait_for_calls(1).await;
            store.set_input_value("changed mid-run").unwrap();
        };
        tokio::join!(run, edit);

        let echo = model.prompts_containing("ECHO")[0].clone();
        assert!(echo.contains("the sea"));
        assert!(!echo.contains("changed mid-run"));
    }

    #[tokio::test]
    async fn test_single_node_uses_edited_upstream() {
        let model = Arc::new(
            ScriptedModel::new()
                .reply_when("POET", "generated poem")
                .reply_when("CRITIC", "review"),
        );
        let store = GraphStore::new(chain());
        let runner = runner(&model);
        runner.run_all(&store).await;

        store.edit_output(&"a".into(), "my own poem").unwrap();
        let result = runner.run_node(&store, &"b".into()).await.unwrap();

        assert_eq!(result, NodeResult::executed("review"));
        let prompts = model.prompts_containing("CRITIC");
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("my own poem"));
        assert!(!prompts[1].contains("generated poem"));

        let snap = store.snapshot();
        let a = snap.persona(&"a".into()).unwrap();
        assert_eq!(a.result.origin(), Some(ResultOrigin::ManuallyEdited));
        assert_eq!(a.status, NodeStatus::Completed);
        assert_eq!(status(&store, "b"), NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_single_node_failure_and_errors() {
        let model = Arc::new(ScriptedModel::new().fail_when("CRITIC", "rate limited"));
        let store = GraphStore::new(chain());
        let runner = runner(&model);

        let result = runner.run_node(&store, &"b".into()).await.unwrap();
        assert!(matches!(result, NodeResult::Failed { .. }));
        assert_eq!(status(&store, "b"), NodeStatus::Error);
        assert_eq!(status(&store, "a"), NodeStatus::Idle);

        assert!(matches!(
            runner.run_node(&store, &"nope".into()).await,
            Err(FlowError::NodeNotFound(_))
        ));
        assert!(matches!(
            runner.run_node(&store, &"in".into()).await,
            Err(FlowError::NotAPersona(_))
        ));
    }

    #[tokio::test]
    async fn test_single_node_ignores_active_run() {
        let model = Arc::new(ScriptedModel::new().hang_when("POET").reply_when("CRITIC", "r"));
        let store = GraphStore::new(chain());
        let runner = runner(&model);

        let run = runner.run_all(&store);
        let step = async {
            model.wait_for_calls(1).await;
            let result = runner.run_node(&store, &"b".into()).await.unwrap();
            runner.cancel();
            result
        };
        let (report, result) = tokio::join!(run, step);

        assert_eq!(result, NodeResult::executed("r"));
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(status(&store, "b"), NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_events_published() {
        let model = Arc::new(ScriptedModel::new());
        let store = GraphStore::new(chain());
        let mut rx = store.events().subscribe();
        runner(&model).run_all(&store).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(PipelineEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RunFinished {
                status: RunStatus::Completed,
                ..
            })
        ));
        let layers = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::LayerStarted { .. }))
            .count();
        assert_eq!(layers, 2);
    }
}
