use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::Generation;

/// The hosted generative model behind every persona node.
///
/// Calls are at-most-once: implementations must not retry on their own.
pub trait ModelClient: Send + Sync + 'static {
    /// Send one rendered prompt and wait for the complete response.
    fn generate(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Generation>>;
}
