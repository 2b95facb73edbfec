//! HTTP page fetcher
//!
//! A [`PageFetcher`] backed by reqwest. The caller supplies headers (the
//! engine passes its browser-like defaults) and the per-fetch timeout;
//! redirects are followed and the final URL is reported.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::error::ProviderError;

use super::{FetchedPage, PageFetcher};

/// reqwest-backed page fetcher.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn build_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        map.insert(name, value);
    }
    map
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<FetchedPage, ProviderError> {
        let response = self
            .client
            .get(url)
            .headers(build_headers(headers))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(timeout)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?
            .to_vec();

        Ok(FetchedPage {
            status_code,
            body,
            final_url,
        })
    }
}
