use futures::future::BoxFuture;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use personaflow_core::config::ModelConfig;
use personaflow_core::error::{FlowError, Result};
use personaflow_core::traits::ModelClient;
use personaflow_core::types::*;

use crate::streaming::{SseEvent, SseStream};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini native API client.
pub struct GeminiClient {
    http: Client,
}

impl GeminiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

// ── Request types ────────────────────────────────────────────────

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

// ── Response types ───────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    error: Option<GeminiApiError>,
}

#[derive(Deserialize, Debug)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiUsage {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
}

#[derive(Deserialize, Debug)]
struct GeminiApiError {
    #[serde(default)]
    message: String,
}

// ── Conversion ───────────────────────────────────────────────────

fn build_request(config: &ModelConfig, prompt: String) -> GeminiRequest {
    GeminiRequest {
        contents: vec![GeminiContent {
            role: Some("user".to_string()),
            parts: vec![GeminiPart { text: Some(prompt) }],
        }],
        generation_config: Some(GenerationConfig {
            max_output_tokens: Some(config.max_tokens),
            temperature: if config.temperature > 0.0 {
                Some(config.temperature)
            } else {
                None
            },
        }),
    }
}

fn stream_url(config: &ModelConfig, api_key: &str) -> String {
    let base = config
        .base_url
        .as_deref()
        .unwrap_or(DEFAULT_BASE_URL)
        .trim_end_matches('/');
    format!(
        "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
        base, config.model_id, api_key
    )
}

/// One SSE chunk can carry text, a finish reason and usage together.
fn parse_gemini_chunk(event: &SseEvent) -> Result<Vec<StreamDelta>> {
    let chunk: GeminiStreamChunk = serde_json::from_str(&event.data)
        .map_err(|e| FlowError::ModelResponse(format!("bad Gemini chunk: {}", e)))?;

    if let Some(err) = chunk.error {
        return Err(FlowError::ModelRequest(err.message));
    }

    let mut deltas = Vec::new();

    if let Some(candidate) = chunk.candidates.into_iter().next() {
        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    deltas.push(StreamDelta::TextDelta(text));
                }
            }
        }
        if let Some(reason) = candidate.finish_reason {
            let stop = match reason.as_str() {
                "MAX_TOKENS" => StopReason::MaxTokens,
                "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => StopReason::Safety,
                _ => StopReason::EndTurn,
            };
            deltas.push(StreamDelta::Stop(stop));
        }
    }

    if let Some(usage) = chunk.usage_metadata {
        deltas.push(StreamDelta::Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        });
    }

    Ok(deltas)
}

/// Fold streamed deltas into a finished generation.
fn accumulate(generation: &mut Generation, delta: StreamDelta) -> Result<()> {
    match delta {
        StreamDelta::TextDelta(text) => generation.text.push_str(&text),
        StreamDelta::Usage {
            input_tokens,
            output_tokens,
        } => {
            generation.input_tokens = input_tokens;
            generation.output_tokens = output_tokens;
        }
        StreamDelta::Stop(StopReason::Safety) if generation.text.is_empty() => {
            return Err(FlowError::ModelResponse(
                "response blocked by safety filters".into(),
            ));
        }
        StreamDelta::Stop(reason) => debug!(?reason, "Gemini stream stopped"),
    }
    Ok(())
}

impl ModelClient for GeminiClient {
    fn generate(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Generation>> {
        let config = config.clone();

        Box::pin(async move {
            let api_key = config
                .api_key
                .as_deref()
                .ok_or_else(|| FlowError::Config("Gemini: api_key is required".into()))?;

            let url = stream_url(&config, api_key);
            let body = build_request(&config, prompt);

            let response = self
                .http
                .post(&url)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| FlowError::ModelRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(FlowError::ModelRequest(format!("HTTP {}: {}", status, body)));
            }

            let mut events = SseStream::new(response.bytes_stream());
            let mut generation = Generation::default();

            while let Some(event) = events.next().await {
                let event = event?;
                if event.data.trim() == "[DONE]" {
                    break;
                }
                match parse_gemini_chunk(&event) {
                    Ok(deltas) => {
                        for delta in deltas {
                            accumulate(&mut generation, delta)?;
                        }
                    }
                    Err(FlowError::ModelResponse(e)) => {
                        warn!(data = %event.data, error = %e, "Skipping unparseable Gemini SSE chunk");
                    }
                    Err(e) => return Err(e),
                }
            }

            debug!(
                model = %config.model_id,
                input_tokens = generation.input_tokens,
                output_tokens = generation.output_tokens,
                "Gemini generation complete"
            );

            Ok(generation)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_string(),
        }
    }

    fn config() -> ModelConfig {
        ModelConfig {
            provider: "gemini".into(),
            model_id: "gemini-2.5-flash".into(),
            api_key: Some("k".into()),
            base_url: None,
            max_tokens: 2048,
            temperature: 0.0,
        }
    }

    #[test]
    fn test_parse_text_chunk() {
        let deltas = parse_gemini_chunk(&event(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"}]}}]}"#,
        ))
        .unwrap();
        assert_eq!(deltas, vec![StreamDelta::TextDelta("Hello".into())]);
    }

    #[test]
    fn test_parse_final_chunk_with_usage() {
        let deltas = parse_gemini_chunk(&event(
            r#"{"candidates":[{"content":{"parts":[{"text":" world"}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":12,"candidatesTokenCount":3}}"#,
        ))
        .unwrap();
        assert_eq!(
            deltas,
            vec![
                StreamDelta::TextDelta(" world".into()),
                StreamDelta::Stop(StopReason::EndTurn),
                StreamDelta::Usage {
                    input_tokens: 12,
                    output_tokens: 3
                },
            ]
        );
    }

    #[test]
    fn test_parse_api_error_chunk() {
        let err = parse_gemini_chunk(&event(r#"{"error":{"code":429,"message":"quota"}}"#))
            .unwrap_err();
        assert!(matches!(err, FlowError::ModelRequest(m) if m == "quota"));
    }

    #[test]
    fn test_parse_garbage_is_response_error() {
        let err = parse_gemini_chunk(&event("not json")).unwrap_err();
        assert!(matches!(err, FlowError::ModelResponse(_)));
    }

    #[test]
    fn test_accumulate_text_and_usage() {
        let mut generation = Generation::default();
        accumulate(&mut generation, StreamDelta::TextDelta("a".into())).unwrap();
        accumulate(&mut generation, StreamDelta::TextDelta("b".into())).unwrap();
        accumulate(
            &mut generation,
            StreamDelta::Usage {
                input_tokens: 5,
                output_tokens: 2,
            },
        )
        .unwrap();
        accumulate(&mut generation, StreamDelta::Stop(StopReason::EndTurn)).unwrap();
        assert_eq!(generation.text, "ab");
        assert_eq!(generation.input_tokens, 5);
        assert_eq!(generation.output_tokens, 2);
    }

    #[test]
    fn test_safety_stop_without_text_is_error() {
        let mut generation = Generation::default();
        let err = accumulate(&mut generation, StreamDelta::Stop(StopReason::Safety)).unwrap_err();
        assert!(matches!(err, FlowError::ModelResponse(_)));
    }

    #[test]
    fn test_request_shape() {
        let body = serde_json::to_value(build_request(&config(), "Summarize.".into())).unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Summarize.");
        assert_eq!(body["generation_config"]["max_output_tokens"], 2048);
        assert!(body["generation_config"].get("temperature").is_none());
    }

    #[test]
    fn test_stream_url_respects_base_url() {
        let mut cfg = config();
        assert_eq!(
            stream_url(&cfg, "k"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse&key=k"
        );
        cfg.base_url = Some("http://localhost:8080/".into());
        assert!(stream_url(&cfg, "k").starts_with("http://localhost:8080/v1beta/models/"));
    }
}
