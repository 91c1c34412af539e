//! Mocks and fixtures shared by the personaflow test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use personaflow_core::config::{ModelConfig, PipelineConfig};
use personaflow_core::error::{FlowError, Result};
use personaflow_core::traits::ModelClient;
use personaflow_core::types::Generation;

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(String),
    Hang,
}

/// A `ModelClient` that answers from a script keyed on prompt substrings.
///
/// Rules are checked in insertion order; the first whose needle occurs in
/// the prompt wins. Unmatched prompts get the default reply.
pub struct ScriptedModel {
    rules: Vec<(String, Reply)>,
    default_reply: Reply,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    called: Notify,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_reply: Reply::Text("ok".to_string()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            called: Notify::new(),
        }
    }

    pub fn reply_when(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Text(text.into())));
        self
    }

    pub fn fail_when(mut self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Fail(message.into())));
        self
    }

    /// Calls matching `needle` never settle.
    pub fn hang_when(mut self, needle: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Reply::Hang));
        self
    }

    pub fn default_reply(mut self, text: impl Into<String>) -> Self {
        self.default_reply = Reply::Text(text.into());
        self
    }

    /// Sleep before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Prompts containing `needle`.
    pub fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.prompts()
            .into_iter()
            .filter(|p| p.contains(needle))
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let notified = self.called.notified();
            if self.call_count() >= n {
                return;
            }
            notified.await;
        }
    }

    fn pick(&self, prompt: &str) -> Reply {
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelClient for ScriptedModel {
    fn generate(&self, _config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let reply = self.pick(&prompt);
            self.prompts.lock().unwrap().push(prompt);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.called.notify_waiters();

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            match reply {
                Reply::Text(text) => Ok(Generation::text(text)),
                Reply::Fail(message) => Err(FlowError::ModelRequest(message)),
                Reply::Hang => std::future::pending().await,
            }
        })
    }
}

/// A model config that never reaches a real provider.
pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "scripted".to_string(),
        model_id: "scripted-1".to_string(),
        api_key: None,
        base_url: None,
        max_tokens: 1024,
        temperature: 0.0,
    }
}

pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig::default()
}
