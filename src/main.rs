use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use personaflow_core::config::AppConfig;
use personaflow_core::event::EventBus;
use personaflow_core::types::{NodeId, NodeResult, NodeStatus, PipelineEvent, RunStatus};
use personaflow_pipeline::{
    compute_ready_layer, document, GraphStore, Node, NodeKind, PipelineGraph, PipelineHost,
    PipelineRunner,
};

#[derive(Parser)]
#[command(name = "personaflow", version, about = "Run persona pipelines against a hosted model")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "personaflow.toml", env = "PERSONAFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty pipeline file with a single input node
    New {
        /// Pipeline file to create
        pipeline: PathBuf,
        /// Initial input text
        #[arg(long, default_value = "")]
        input: String,
    },
    /// Add a persona node fed by the given sources
    Add {
        /// Pipeline file
        pipeline: PathBuf,
        /// Persona label shown in prompts downstream
        label: String,
        /// Persona instruction text
        #[arg(short, long, default_value = "")]
        instruction: String,
        /// Source node ids (repeatable)
        #[arg(long = "from")]
        sources: Vec<String>,
    },
    /// Remove a node and every edge touching it
    Remove {
        /// Pipeline file
        pipeline: PathBuf,
        /// Node to remove
        node: String,
    },
    /// Run every reachable node, layer by layer
    Run {
        /// Pipeline file
        pipeline: PathBuf,
        /// Replace the input text before running
        #[arg(long)]
        input: Option<String>,
        /// Do not write results back to the pipeline file
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single node using its sources' current outputs
    Step {
        /// Pipeline file
        pipeline: PathBuf,
        /// Node to run
        node: String,
        /// Do not write the result back to the pipeline file
        #[arg(long)]
        dry_run: bool,
    },
    /// Show which nodes would run next
    Ready {
        /// Pipeline file
        pipeline: PathBuf,
    },
    /// Replace a node's output by hand
    Edit {
        /// Pipeline file
        pipeline: PathBuf,
        /// Node to edit
        node: String,
        /// New output text
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Replace the input node's text
    Input {
        /// Pipeline file
        pipeline: PathBuf,
        /// New input text
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("personaflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::New { pipeline, input } => {
            if pipeline.exists() {
                anyhow::bail!("{} already exists", pipeline.display());
            }
            let graph = PipelineGraph::new().with_node(Node::input("input", input));
            document::save(&pipeline, &graph)?;
            println!("Created {}", pipeline.display());
        }
        Commands::Add {
            pipeline,
            label,
            instruction,
            sources,
        } => {
            let mut graph = document::load(&pipeline)?;
            let id = NodeId::new();
            for source in &sources {
                if graph.node(&NodeId::from(source.as_str())).is_none() {
                    anyhow::bail!("source node '{}' not found", source);
                }
            }
            graph.add_node(Node::persona(id.clone(), label).with_instruction(instruction));
            for source in sources {
                graph.connect(source.as_str(), id.clone());
            }
            document::save(&pipeline, &graph)?;
            println!("{}", id);
        }
        Commands::Remove { pipeline, node } => {
            let mut graph = document::load(&pipeline)?;
            if graph.remove_node(&NodeId::from(node.as_str())).is_none() {
                anyhow::bail!("node '{}' not found", node);
            }
            document::save(&pipeline, &graph)?;
            println!("Removed {}", node);
        }
        Commands::Run {
            pipeline,
            input,
            dry_run,
        } => {
            let config = load_config(&cli.config)?;
            let store = GraphStore::with_events(
                document::load(&pipeline)?,
                EventBus::new(config.pipeline.event_capacity),
            );
            if let Some(text) = input {
                store.set_input_value(text)?;
            }
            let runner = Arc::new(build_runner(&config)?);

            let printer = tokio::spawn(print_events(store.events().subscribe()));

            let cancel_runner = runner.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Stopping pipeline run...");
                cancel_runner.cancel();
            });

            let report = runner.run_all(&store).await;
            // Dropping the store closes the event channel once the printer
            // has drained it.
            let graph = store.into_graph();
            printer.await.ok();

            println!();
            println!(
                "Run {}: {} completed, {} failed, {} unresolved ({} layers, {} ms)",
                status_label(report.status),
                report.completed.len(),
                report.failed.len(),
                report.unresolved.len(),
                report.layers,
                report.elapsed_ms
            );
            for id in &report.unresolved {
                println!("  not run: {}", id);
            }

            print_outputs(&graph);
            if !dry_run {
                document::save(&pipeline, &graph)?;
            }
        }
        Commands::Step {
            pipeline,
            node,
            dry_run,
        } => {
            let config = load_config(&cli.config)?;
            let store = GraphStore::new(document::load(&pipeline)?);
            let runner = build_runner(&config)?;

            let result = runner.run_node(&store, &NodeId::from(node.as_str())).await?;
            match result.text() {
                "" => println!("{} failed: {:?}", node, result),
                text => println!("{}", text),
            }
            if !dry_run {
                document::save(&pipeline, &store.snapshot())?;
            }
        }
        Commands::Ready { pipeline } => {
            let graph = document::load(&pipeline)?;
            let ready = compute_ready_layer(&graph, &settled_nodes(&graph));
            if ready.is_empty() {
                println!("No nodes are ready.");
            }
            for id in ready {
                let label = graph.persona(&id).map(|p| p.label.as_str()).unwrap_or("");
                println!("{}\t{}", id, label);
            }
        }
        Commands::Edit {
            pipeline,
            node,
            text,
        } => {
            let store = GraphStore::new(document::load(&pipeline)?);
            store.edit_output(&NodeId::from(node.as_str()), text.join(" "))?;
            document::save(&pipeline, &store.snapshot())?;
            println!("Updated {}", node);
        }
        Commands::Input { pipeline, text } => {
            let mut graph = document::load(&pipeline)?;
            graph.set_input_value(text.join(" "))?;
            document::save(&pipeline, &graph)?;
            println!("Input updated");
        }
        Commands::Config => {
            let mut config = load_config(&cli.config)?;
            if config.model.api_key.is_some() {
                config.model.api_key = Some("********".to_string());
            }
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load(path)?;
    info!(
        provider = %config.model.provider,
        model = %config.model.model_id,
        "Config loaded"
    );
    Ok(config)
}

fn build_runner(config: &AppConfig) -> anyhow::Result<PipelineRunner> {
    let client = personaflow_llm::create_client(&config.model)?;
    Ok(PipelineRunner::new(
        Arc::from(client),
        config.model.clone(),
        config.pipeline.clone(),
    ))
}

/// The input node plus every persona whose output is already final.
fn settled_nodes(graph: &PipelineGraph) -> HashSet<NodeId> {
    graph
        .nodes
        .iter()
        .filter(|n| n.is_input() || n.status() == NodeStatus::Completed)
        .map(|n| n.id.clone())
        .collect()
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Ignored => "ignored",
    }
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<PipelineEvent>) {
    loop {
        match rx.recv().await {
            Ok(PipelineEvent::LayerStarted { nodes, .. }) => {
                let names: Vec<_> = nodes.iter().map(|id| id.as_str()).collect();
                println!("▶ {}", names.join(", "));
            }
            Ok(PipelineEvent::NodeStatusChanged { node_id, status }) => match status {
                NodeStatus::Completed => println!("  ✓ {}", node_id),
                NodeStatus::Error => println!("  ✗ {}", node_id),
                _ => {}
            },
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event printer lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_outputs(graph: &PipelineGraph) {
    for node in &graph.nodes {
        if let NodeKind::Persona(p) = &node.kind {
            println!();
            println!("== {} [{}] ({})", p.label, node.id, p.status);
            match &p.result {
                NodeResult::Failed { cause } => println!("error: {}", cause),
                result => println!("{}", result.text()),
            }
        }
    }
}
