//! Worker Proxy (C5).
//!
//! Translates logical chat/completion requests into calls against one resident worker's HTTP
//! API: strips the `model` field workers never needed, fills in family-specific default stop
//! sequences, retries `503` with a fixed backoff ladder, and decodes SSE streams with
//! partial-success semantics. Grounded on the teacher's `core/retry.rs` backoff-policy shape
//! (`delay_for_attempt`) and `api/chat.rs`'s streaming/backpressure idiom, generalized from an
//! in-process call to an outbound HTTP hop per request.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use utoipa::ToSchema;

use crate::errors::OrchestratorError;
use crate::observability::Metrics;

/// Fixed backoff ladder for `503` responses (spec §4.5 step 3): 500ms, 1s, 2s, then 3s capped.
const BACKOFF_LADDER_MS: [u64; 4] = [500, 1000, 2000, 3000];
const MAX_RETRY_ATTEMPTS: u32 = 15;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub model: String,
    pub tokens_generated: usize,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub tokens_generated: usize,
    pub finish_reason: String,
}

/// Model family inferred from the id, used purely to pick sensible default stop sequences.
enum ModelFamily {
    Llama3,
    Phi3,
    ChatMl,
}

fn infer_family(model_id: &str) -> ModelFamily {
    let lower = model_id.to_lowercase();
    if lower.contains("llama-3") || lower.contains("llama3") {
        ModelFamily::Llama3
    } else if lower.contains("phi-3") || lower.contains("phi3") {
        ModelFamily::Phi3
    } else {
        ModelFamily::ChatMl
    }
}

fn default_stop_sequences(model_id: &str) -> Vec<String> {
    match infer_family(model_id) {
        ModelFamily::Llama3 => vec!["<|eot_id|>".to_string()],
        ModelFamily::Phi3 => vec!["<|end|>".to_string()],
        ModelFamily::ChatMl => vec!["<|im_end|>".to_string()],
    }
}

/// Base URL for a worker resident on this host at `port`.
pub fn local_worker_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// Thin HTTP client wrapper around a worker's OpenAI-compatible surface, shared across workers.
pub struct WorkerProxy {
    http: reqwest::Client,
    metrics: std::sync::Arc<Metrics>,
}

impl WorkerProxy {
    pub fn new(http: reqwest::Client, metrics: std::sync::Arc<Metrics>) -> Self {
        Self { http, metrics }
    }

    pub async fn chat(
        &self,
        base_url: &str,
        model_id: &str,
        mut req: ChatRequest,
    ) -> Result<ChatResponse, OrchestratorError> {
        req.model = None;
        if req.stop.is_none() {
            req.stop = Some(default_stop_sequences(model_id));
        }

        let body = self.post_with_retry(base_url, model_id, "/v1/chat/completions", &req).await?;
        parse_chat_response(body, model_id)
    }

    pub async fn completion(
        &self,
        base_url: &str,
        model_id: &str,
        mut req: CompletionRequest,
    ) -> Result<CompletionResponse, OrchestratorError> {
        req.model = None;
        if req.stop.is_none() {
            req.stop = Some(default_stop_sequences(model_id));
        }

        let body = self.post_with_retry(base_url, model_id, "/v1/completions", &req).await?;
        parse_completion_response(body, model_id)
    }

    /// Stream chat tokens via `on_token`. Returns `Ok(())` if at least one token was delivered
    /// before the stream ended, even on a subsequent I/O error (spec §4.5 step 5).
    pub async fn chat_stream(
        &self,
        base_url: &str,
        model_id: &str,
        mut req: ChatRequest,
        mut on_token: impl FnMut(String) + Send,
    ) -> Result<(), OrchestratorError> {
        req.model = None;
        req.stream = true;
        if req.stop.is_none() {
            req.stop = Some(default_stop_sequences(model_id));
        }
        self.stream_with_retry(base_url, model_id, "/v1/chat/completions", &req, &mut on_token).await
    }

    pub async fn completion_stream(
        &self,
        base_url: &str,
        model_id: &str,
        mut req: CompletionRequest,
        mut on_token: impl FnMut(String) + Send,
    ) -> Result<(), OrchestratorError> {
        req.model = None;
        req.stream = true;
        if req.stop.is_none() {
            req.stop = Some(default_stop_sequences(model_id));
        }
        self.stream_with_retry(base_url, model_id, "/v1/completions", &req, &mut on_token).await
    }

    async fn post_with_retry(
        &self,
        base_url: &str,
        model_id: &str,
        path: &str,
        body: &impl Serialize,
    ) -> Result<Value, OrchestratorError> {
        let url = format!("{base_url}{path}");

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            let response = self.http.post(&url).json(body).send().await;

            match response {
                Ok(resp) if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    warn!(attempt, path, "worker busy, backing off");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
                Ok(resp) if resp.status().is_success() => {
                    self.metrics.proxy_retry_attempts.observe((attempt + 1) as f64);
                    return resp.json::<Value>().await.map_err(|e| {
                        OrchestratorError::WorkerExited { model_id: model_id.to_string(), message: e.to_string() }
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err_body = resp.json::<Value>().await.ok();
                    return Err(classify_worker_error(status, err_body));
                }
                Err(e) => {
                    return Err(OrchestratorError::WorkerExited {
                        model_id: model_id.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(OrchestratorError::busy(MAX_RETRY_ATTEMPTS))
    }

    async fn stream_with_retry(
        &self,
        base_url: &str,
        model_id: &str,
        path: &str,
        body: &impl Serialize,
        on_token: &mut (impl FnMut(String) + Send),
    ) -> Result<(), OrchestratorError> {
        use futures::StreamExt;

        let url = format!("{base_url}{path}");

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            let response = self.http.post(&url).json(body).send().await;

            let resp = match response {
                Ok(resp) if resp.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
                Ok(resp) if resp.status().is_success() => {
                    self.metrics.proxy_retry_attempts.observe((attempt + 1) as f64);
                    resp
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err_body = resp.json::<Value>().await.ok();
                    return Err(classify_worker_error(status, err_body));
                }
                Err(e) => {
                    return Err(OrchestratorError::WorkerExited {
                        model_id: model_id.to_string(),
                        message: e.to_string(),
                    });
                }
            };

            let mut byte_stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut tokens_delivered = 0usize;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        return if tokens_delivered > 0 {
                            Ok(())
                        } else {
                            Err(OrchestratorError::WorkerExited {
                                model_id: model_id.to_string(),
                                message: e.to_string(),
                            })
                        };
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);

                    let Some(data) = frame.strip_prefix("data: ") else { continue };
                    if data.trim() == "[DONE]" {
                        return Ok(());
                    }
                    if let Some(token) = extract_delta_text(data) {
                        tokens_delivered += 1;
                        on_token(token);
                    }
                }
            }

            return if tokens_delivered > 0 {
                Ok(())
            } else {
                Err(OrchestratorError::WorkerExited {
                    model_id: model_id.to_string(),
                    message: "stream ended before any token was delivered".to_string(),
                })
            };
        }

        Err(OrchestratorError::busy(MAX_RETRY_ATTEMPTS))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(BACKOFF_LADDER_MS.len() - 1);
    Duration::from_millis(BACKOFF_LADDER_MS[idx])
}

fn classify_worker_error(status: reqwest::StatusCode, body: Option<Value>) -> OrchestratorError {
    if let Some(body) = &body {
        let message = body
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
            .unwrap_or("");
        if message.to_lowercase().contains("projector") || message.to_lowercase().contains("mmproj") {
            return OrchestratorError::MissingProjector(message.to_string());
        }
    }
    OrchestratorError::WorkerExited {
        model_id: String::new(),
        message: format!("worker returned {status}: {body:?}"),
    }
}

fn extract_delta_text(data: &str) -> Option<String> {
    let json: Value = serde_json::from_str(data).ok()?;
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta").or_else(|| c.get("text").map(|_| c)))
        .and_then(|d| {
            d.get("content")
                .or_else(|| d.get("text"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
}

fn parse_chat_response(body: Value, model_id: &str) -> Result<ChatResponse, OrchestratorError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| malformed(model_id))?;
    let message = choice.get("message").ok_or_else(|| malformed(model_id))?;
    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("assistant").to_string();
    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).unwrap_or("stop").to_string();
    let tokens_generated = body
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;

    Ok(ChatResponse {
        message: ChatMessage { role, content },
        model: model_id.to_string(),
        tokens_generated,
        finish_reason,
    })
}

fn parse_completion_response(body: Value, model_id: &str) -> Result<CompletionResponse, OrchestratorError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| malformed(model_id))?;
    let text = choice.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).unwrap_or("stop").to_string();
    let tokens_generated = body
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;

    Ok(CompletionResponse { text, model: model_id.to_string(), tokens_generated, finish_reason })
}

fn malformed(model_id: &str) -> OrchestratorError {
    OrchestratorError::WorkerExited {
        model_id: model_id.to_string(),
        message: "worker response did not contain a choices[0] entry".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stop_sequences_by_family() {
        assert_eq!(default_stop_sequences("llama-3-8b-instruct"), vec!["<|eot_id|>".to_string()]);
        assert_eq!(default_stop_sequences("phi-3-mini"), vec!["<|end|>".to_string()]);
        assert_eq!(default_stop_sequences("qwen2-7b"), vec!["<|im_end|>".to_string()]);
    }

    #[test]
    fn test_backoff_ladder_caps_at_3s() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_millis(3000));
        assert_eq!(backoff_delay(14), Duration::from_millis(3000));
    }

    #[test]
    fn test_classify_missing_projector() {
        let body = serde_json::json!({"error": {"message": "missing mmproj file for multimodal input"}});
        let err = classify_worker_error(reqwest::StatusCode::BAD_REQUEST, Some(body));
        assert!(matches!(err, OrchestratorError::MissingProjector(_)));
    }

    #[test]
    fn test_extract_delta_text_from_sse_frame() {
        let frame = r#"{"choices":[{"delta":{"content":"hello"}}]}"#;
        assert_eq!(extract_delta_text(frame), Some("hello".to_string()));
    }

    #[test]
    fn test_parse_chat_response_reads_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"completion_tokens": 3}
        });
        let parsed = parse_chat_response(body, "llama-3-8b").unwrap();
        assert_eq!(parsed.message.content, "hi");
        assert_eq!(parsed.tokens_generated, 3);
    }
}
