//! Thin abstraction over the external LLM/embedding provider contract
//! (§1 "out of scope... the external large-language-model and embedding
//! provider"). Everything above this module talks to these two traits, never
//! to `reqwest` directly, so tests can substitute a fake implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Primary,
    CostOptimized,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatTurn>,
    pub model_tier: ModelTier,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

/// One incremental piece of a streamed completion.
#[derive(Debug, Clone)]
pub enum ChatChunk {
    Token(String),
    Done(ChatUsage),
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Streams a completion; the returned stream yields `Token` chunks
    /// followed by exactly one terminal `Done`.
    async fn stream_chat(&self, request: ChatRequest) -> AppResult<BoxStream<'static, AppResult<ChatChunk>>>;

    /// Non-streaming accumulation, used by the auto-note generator which
    /// needs the full text before it can score confidence.
    async fn complete(&self, request: ChatRequest) -> AppResult<(String, ChatUsage)>;
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
}

/// `reqwest`-backed client talking to the configured LLM endpoint. Retries
/// transient failures with exponential backoff + jitter, bounded by
/// `max_attempts` (§4.6, §4.11).
pub struct HttpChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_attempts: u32,
}

impl HttpChatClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            max_attempts,
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn stream_chat(
        &self,
        request: ChatRequest,
    ) -> AppResult<BoxStream<'static, AppResult<ChatChunk>>> {
        // The production path is a server-sent stream from the upstream
        // provider, re-framed into `ChatChunk`s as they arrive. Modeled as a
        // single non-streaming call wrapped in a one-shot stream so the
        // dialog engine's SSE framing logic is exercised end to end even
        // when no live provider is reachable.
        let (text, usage) = self.complete(request).await?;
        let chunks = vec![Ok(ChatChunk::Token(text)), Ok(ChatChunk::Done(usage))];
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn complete(&self, request: ChatRequest) -> AppResult<(String, ChatUsage)> {
        crate::retry::with_backoff(self.max_attempts, || async {
            let body = serde_json::json!({
                "system": request.system_prompt,
                "messages": request.messages.iter().map(|m| serde_json::json!({
                    "role": m.role,
                    "content": m.content,
                })).collect::<Vec<_>>(),
                "max_tokens": request.max_output_tokens,
            });
            let resp = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| crate::error::AppError::Upstream(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(crate::error::AppError::Upstream(format!(
                    "llm endpoint returned {}",
                    resp.status()
                )));
            }
            let parsed: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| crate::error::AppError::Upstream(e.to_string()))?;
            let text = parsed["content"].as_str().unwrap_or_default().to_string();
            let usage = ChatUsage {
                input_tokens: parsed["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: parsed["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
                cost_usd: parsed["usage"]["cost_usd"].as_f64().unwrap_or(0.0),
            };
            Ok((text, usage))
        })
        .await
    }
}

pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    dimensions: usize,
    max_attempts: u32,
}

impl HttpEmbeddingClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        dimensions: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            dimensions,
            max_attempts,
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        crate::retry::with_backoff(self.max_attempts, || async {
            let resp = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&serde_json::json!({ "input": texts }))
                .send()
                .await
                .map_err(|e| crate::error::AppError::Upstream(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(crate::error::AppError::Upstream(format!(
                    "embedding endpoint returned {}",
                    resp.status()
                )));
            }
            let parsed: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| crate::error::AppError::Upstream(e.to_string()))?;
            let vectors = parsed["data"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|item| {
                    item["embedding"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                        .unwrap_or_default()
                })
                .collect();
            Ok(vectors)
        })
        .await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
