pub mod providers;
pub mod streaming;

use personaflow_core::config::ModelConfig;
use personaflow_core::error::{FlowError, Result};
use personaflow_core::traits::ModelClient;

pub use providers::gemini::GeminiClient;

/// Create a model client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn ModelClient>> {
    match config.provider.as_str() {
        "gemini" | "google" => Ok(Box::new(GeminiClient::new())),
        other => Err(FlowError::UnsupportedProvider(other.to_string())),
    }
}
