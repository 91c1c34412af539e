use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Model errors
    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Model streaming error: {0}")]
    ModelStream(String),

    #[error("Model response malformed: {0}")]
    ModelResponse(String),

    #[error("Model provider not supported: {0}")]
    UnsupportedProvider(String),

    // Pipeline errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node is not a persona: {0}")]
    NotAPersona(String),

    #[error("Node is running, output cannot be edited: {0}")]
    NodeBusy(String),

    #[error("Pipeline has no input node")]
    NoInputNode,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
