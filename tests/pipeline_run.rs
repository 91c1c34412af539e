use std::sync::Arc;

use personaflow_core::types::{NodeId, NodeStatus, ResultOrigin, RunStatus};
use personaflow_pipeline::{document, GraphStore, Node, PipelineGraph, PipelineHost, PipelineRunner};
use personaflow_test_utils::{test_model_config, test_pipeline_config, ScriptedModel};

fn review_pipeline() -> PipelineGraph {
    PipelineGraph::new()
        .with_node(Node::input("input", "Launch a lunar bakery"))
        .with_node(Node::persona("pitch", "Marketer").with_instruction("MARKETER: write a pitch."))
        .with_node(Node::persona("risks", "Skeptic").with_instruction("SKEPTIC: list the risks."))
        .with_node(Node::persona("memo", "Editor").with_instruction("EDITOR: merge into a memo."))
        .with_edge("input", "pitch")
        .with_edge("input", "risks")
        .with_edge("pitch", "memo")
        .with_edge("risks", "memo")
}

#[tokio::test]
async fn test_document_run_and_human_edit_cycle() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("pipeline.json");
    document::save(&path, &review_pipeline()).expect("save pipeline");

    let model = Arc::new(
        ScriptedModel::new()
            .reply_when("MARKETER", "Fresh croissants at 1/6 g")
            .reply_when("SKEPTIC", "Oxygen costs")
            .reply_when("EDITOR", "Memo v1"),
    );
    let runner = PipelineRunner::new(model.clone(), test_model_config(), test_pipeline_config());

    // Full run from the saved document.
    let store = GraphStore::new(document::load(&path).expect("load pipeline"));
    let report = runner.run_all(&store).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.layers, 2);
    assert_eq!(report.completed.last(), Some(&NodeId::from("memo")));

    let memo_prompt = model.prompts_containing("EDITOR")[0].clone();
    assert!(memo_prompt.contains("Fresh croissants at 1/6 g"));
    assert!(memo_prompt.contains("Oxygen costs"));
    document::save(&path, &store.snapshot()).expect("save results");

    // A human rewrites the skeptic's output, then re-runs only the memo.
    let store = GraphStore::new(document::load(&path).expect("reload pipeline"));
    store
        .edit_output(&NodeId::from("risks"), "Oxygen costs and cosmic rays")
        .expect("edit output");
    runner
        .run_node(&store, &NodeId::from("memo"))
        .await
        .expect("run memo");

    let second = model.prompts_containing("EDITOR")[1].clone();
    assert!(second.contains("Oxygen costs and cosmic rays"));
    assert_eq!(model.prompts_containing("SKEPTIC").len(), 1);

    let graph = store.snapshot();
    let risks = graph.persona(&NodeId::from("risks")).expect("risks node");
    assert_eq!(risks.result.origin(), Some(ResultOrigin::ManuallyEdited));
    assert_eq!(risks.status, NodeStatus::Completed);
    assert_eq!(
        graph.persona(&NodeId::from("memo")).map(|p| p.status),
        Some(NodeStatus::Completed)
    );
}

#[tokio::test]
async fn test_pipeline_without_input_node() {
    let graph = PipelineGraph::new()
        .with_node(Node::persona("a", "A"))
        .with_node(Node::persona("b", "B"))
        .with_edge("a", "b");
    let model = Arc::new(ScriptedModel::new());
    let runner = PipelineRunner::new(model.clone(), test_model_config(), test_pipeline_config());
    let store = GraphStore::new(graph);

    let report = runner.run_all(&store).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.unresolved.len(), 2);
    assert_eq!(model.call_count(), 0);
}
