//! Pipeline execution engine.
//!
//! A pipeline is a DAG of persona nodes seeded by a single input node. The
//! [`PipelineRunner`] repeatedly asks the resolver for the next ready layer,
//! runs every node of that layer concurrently through the [`NodeExecutor`],
//! and writes results back through a [`PipelineHost`], until nothing is
//! left to run or the run is cancelled.

pub mod document;
pub mod executor;
pub mod graph;
pub mod resolver;
pub mod runner;
pub mod store;

pub use executor::{ExecutionError, NodeExecutor, UpstreamContext};
pub use graph::{Edge, Node, NodeKind, PersonaNode, PipelineGraph};
pub use resolver::compute_ready_layer;
pub use runner::{PipelineRunner, RunReport};
pub use store::{GraphStore, PipelineHost};
