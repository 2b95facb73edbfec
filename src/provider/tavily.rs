//! Tavily web search provider
//!
//! Implements [`SearchProvider`] against the Tavily Search API. Error
//! classification follows the engine's transient/permanent split so the
//! retry discipline in [`super::search_with_retry`] applies unchanged.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;

use super::{SearchHit, SearchProvider};

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

/// Tavily Search API client.
pub struct TavilySearch {
    api_key: String,
    client: Client,
    endpoint: String,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::new(),
            endpoint: TAVILY_ENDPOINT.to_string(),
        }
    }

    /// Create from the `TAVILY_API_KEY` environment variable.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("TAVILY_API_KEY").map_err(|_| {
            ProviderError::NotConfigured("TAVILY_API_KEY environment variable not set".into())
        })?;
        Ok(Self::new(api_key))
    }

    /// Override the API endpoint (used by tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'a str,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        let request = TavilyRequest {
            api_key: &self.api_key,
            query,
            max_results,
            search_depth: "basic",
        };

        // The caller enforces the search timeout; any reqwest failure here
        // is a transport error.
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
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

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        debug!(query, results = parsed.results.len(), "tavily search complete");

        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                snippet: r.content,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_without_key_is_not_configured() {
        std::env::remove_var("TAVILY_API_KEY");
        assert!(matches!(
            TavilySearch::from_env(),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn response_parsing_tolerates_missing_fields() {
        let raw = r#"{"results": [{"url": "https://a.com"}]}"#;
        let parsed: TavilyResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert!(parsed.results[0].title.is_empty());
    }

    #[test]
    fn empty_response_parses() {
        let parsed: TavilyResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.results.is_empty());
    }
}
