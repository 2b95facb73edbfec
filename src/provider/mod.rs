//! External collaborator interfaces
//!
//! The engine depends only on the traits in this module: a web search
//! provider, a page fetcher, role-keyed model endpoints, and an optional
//! checkpoint sink. Concrete implementations live in the submodules and
//! are wired by the caller.

pub mod checkpoint;
pub mod fetcher;
pub mod openai;
pub mod tavily;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::warn;

use crate::error::{ProviderError, ResearchError};
use crate::state::ResearchState;

/// Backoff before the single retry of a transient search failure.
pub const SEARCH_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One web search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Web search provider.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError>;
}

/// Raw result of fetching one URL.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status_code: u16,
    pub body: Vec<u8>,
    pub final_url: String,
}

/// Page fetcher. Implementations must send the supplied headers verbatim;
/// the engine provides browser-like defaults and never identifies itself
/// as a bot.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<FetchedPage, ProviderError>;
}

/// Default request headers for page fetches.
pub fn default_fetch_headers() -> Vec<(String, String)> {
    vec![
        (
            "User-Agent".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
                .to_string(),
        ),
        (
            "Accept-Language".to_string(),
            "en-US,en;q=0.9".to_string(),
        ),
    ]
}

/// Logical model endpoint roles, each with its own sampling temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Planner,
    SearcherAnalyzer,
    Analyzer,
    Writer,
    Critic,
}

impl ModelRole {
    pub fn temperature(&self) -> f32 {
        match self {
            ModelRole::Planner => 0.3,
            ModelRole::SearcherAnalyzer => 0.5,
            ModelRole::Analyzer => 0.3,
            ModelRole::Writer => 0.7,
            ModelRole::Critic => 0.2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Planner => "planner",
            ModelRole::SearcherAnalyzer => "searcher_analyzer",
            ModelRole::Analyzer => "analyzer",
            ModelRole::Writer => "writer",
            ModelRole::Critic => "critic",
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prompt for one model call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: ModelRole,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
}

impl ModelRequest {
    pub fn new(role: ModelRole, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role,
            system: system.into(),
            prompt: prompt.into(),
            temperature: role.temperature(),
        }
    }
}

/// Token usage reported by a model endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Complete output of one model call.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub text: String,
    pub usage: TokenUsage,
}

/// One chunk of a streaming completion. Usage, when reported, arrives on
/// the final chunk.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub delta: String,
    pub usage: Option<TokenUsage>,
}

/// Boxed stream of completion chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// A model endpoint: prompt in, structured text out, with optional
/// streaming of output tokens.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelOutput, ProviderError>;

    /// Streaming completion. The default wraps `complete` in a single
    /// final chunk, for endpoints without native streaming.
    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream, ProviderError> {
        let output = self.complete(request).await?;
        let chunk = StreamChunk {
            delta: output.text,
            usage: Some(output.usage),
        };
        Ok(Box::pin(futures::stream::once(async move {
            Ok::<_, ProviderError>(chunk)
        })))
    }
}

/// Role-keyed registry of model endpoints.
///
/// `call` applies the per-call timeout and retries once on a transient
/// failure; a second failure is the caller's to degrade.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    endpoints: HashMap<ModelRole, Arc<dyn ModelEndpoint>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an endpoint to a role.
    pub fn bind(mut self, role: ModelRole, endpoint: Arc<dyn ModelEndpoint>) -> Self {
        self.endpoints.insert(role, endpoint);
        self
    }

    /// Bind one endpoint to every role.
    pub fn bind_all(mut self, endpoint: Arc<dyn ModelEndpoint>) -> Self {
        for role in [
            ModelRole::Planner,
            ModelRole::SearcherAnalyzer,
            ModelRole::Analyzer,
            ModelRole::Writer,
            ModelRole::Critic,
        ] {
            self.endpoints.insert(role, Arc::clone(&endpoint));
        }
        self
    }

    fn endpoint(&self, role: ModelRole) -> Result<&Arc<dyn ModelEndpoint>, ProviderError> {
        self.endpoints
            .get(&role)
            .ok_or_else(|| ProviderError::NotConfigured(format!("no endpoint bound for {role}")))
    }

    /// Timed, once-retried completion.
    pub async fn call(
        &self,
        request: &ModelRequest,
        call_timeout: Duration,
    ) -> Result<ModelOutput, ProviderError> {
        let endpoint = self.endpoint(request.role)?;

        let first = timed_complete(endpoint.as_ref(), request, call_timeout).await;
        match first {
            Ok(output) => Ok(output),
            Err(err) if err.is_transient() => {
                warn!(role = %request.role, error = %err, "model call failed, retrying once");
                timed_complete(endpoint.as_ref(), request, call_timeout).await
            }
            Err(err) => Err(err),
        }
    }

    /// Obtain a token stream. The timeout covers stream establishment;
    /// chunk errors surface to the consumer.
    pub async fn stream(
        &self,
        request: &ModelRequest,
        call_timeout: Duration,
    ) -> Result<ChunkStream, ProviderError> {
        let endpoint = self.endpoint(request.role)?;
        match timeout(call_timeout, endpoint.stream(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(call_timeout)),
        }
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("roles", &self.endpoints.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn timed_complete(
    endpoint: &dyn ModelEndpoint,
    request: &ModelRequest,
    call_timeout: Duration,
) -> Result<ModelOutput, ProviderError> {
    match timeout(call_timeout, endpoint.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(call_timeout)),
    }
}

/// Timed search with one retry after a 500 ms backoff on a transient
/// failure. Permanent failures return the error for the caller to demote
/// to an empty result.
pub async fn search_with_retry(
    provider: &dyn SearchProvider,
    query: &str,
    max_results: usize,
    search_timeout: Duration,
) -> Result<Vec<SearchHit>, ProviderError> {
    let first = timed_search(provider, query, max_results, search_timeout).await;
    match first {
        Ok(hits) => Ok(hits),
        Err(err) if err.is_transient() => {
            warn!(query, error = %err, "search failed, retrying once");
            tokio::time::sleep(SEARCH_RETRY_BACKOFF).await;
            timed_search(provider, query, max_results, search_timeout).await
        }
        Err(err) => Err(err),
    }
}

async fn timed_search(
    provider: &dyn SearchProvider,
    query: &str,
    max_results: usize,
    search_timeout: Duration,
) -> Result<Vec<SearchHit>, ProviderError> {
    match timeout(search_timeout, provider.search(query, max_results)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(search_timeout)),
    }
}

/// Optional checkpoint sink. When configured, the coordinator saves after
/// every stage boundary; when absent, runs are ephemeral.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(&self, thread_id: &str, state: &ResearchState) -> Result<(), ResearchError>;

    async fn load(&self, thread_id: &str) -> Result<Option<ResearchState>, ResearchError>;
}
