//! OpenAI-compatible chat endpoint
//!
//! A [`ModelEndpoint`] speaking the chat-completions wire format, which a
//! wide range of hosted and local servers expose. Supports non-streaming
//! completion with usage accounting and SSE-framed streaming deltas.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;

use super::{ChunkStream, ModelEndpoint, ModelOutput, ModelRequest, StreamChunk, TokenUsage};

/// Chat-completions client for one model.
pub struct OpenAiCompatEndpoint {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatEndpoint {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: model.into(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Create from `OPENAI_BASE_URL`, `OPENAI_API_KEY`, and `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = std::env::var("OPENAI_MODEL").map_err(|_| {
            ProviderError::NotConfigured("OPENAI_MODEL environment variable not set".into())
        })?;
        let mut endpoint = Self::new(base_url, model);
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            endpoint = endpoint.with_api_key(key);
        }
        Ok(endpoint)
    }

    fn request_body(&self, request: &ModelRequest, stream: bool) -> serde_json::Value {
        json!({
            "model": self.model,
            "temperature": request.temperature,
            "stream": stream,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
        })
    }

    async fn post(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        // The caller enforces the model-call timeout; any reqwest failure
        // here is a transport error.
        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage {
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ModelEndpoint for OpenAiCompatEndpoint {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelOutput, ProviderError> {
        let body = self.request_body(request, false);
        let response = self.post(&body).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("response had no choices".into()))?;

        debug!(role = %request.role, chars = text.len(), "completion received");

        Ok(ModelOutput {
            text,
            usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
        })
    }

    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream, ProviderError> {
        let body = self.request_body(request, true);
        let response = self.post(&body).await?;

        let byte_stream = response.bytes_stream();

        // SSE frames arrive as `data: <json>` lines; a frame may be split
        // across chunk boundaries, so carry a line buffer between polls.
        let stream = futures::stream::unfold(
            (byte_stream, String::new(), false),
            |(mut bytes, mut buffer, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim_end_matches('\r').to_string();
                        buffer.drain(..=pos);

                        if line.is_empty() || line.starts_with(':') {
                            continue;
                        }
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return None;
                        }
                        let Ok(frame) = serde_json::from_str::<StreamFrame>(data) else {
                            continue;
                        };
                        let delta = frame
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.clone())
                            .unwrap_or_default();
                        let usage = frame.usage.map(TokenUsage::from);
                        if delta.is_empty() && usage.is_none() {
                            continue;
                        }
                        let chunk = StreamChunk { delta, usage };
                        return Some((Ok(chunk), (bytes, buffer, false)));
                    }

                    match bytes.next().await {
                        Some(Ok(data)) => {
                            buffer.push_str(&String::from_utf8_lossy(&data));
                        }
                        Some(Err(e)) => {
                            let err = ProviderError::Transport(e.to_string());
                            return Some((Err(err), (bytes, buffer, true)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
