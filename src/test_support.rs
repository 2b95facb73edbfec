//! Shared provider doubles for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::provider::{
    FetchedPage, ModelEndpoint, ModelOutput, ModelRequest, PageFetcher, SearchHit,
    SearchProvider, TokenUsage,
};

/// A model endpoint that replays scripted responses.
///
/// With a queue, responses pop in order and the last one repeats once the
/// queue drains; without a queue, the fixed response repeats forever.
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Result<String, ProviderError>,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn returning(text: impl Into<String>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Ok(text.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn sequence<S: Into<String>>(responses: Vec<S>) -> Self {
        let mut queue: VecDeque<Result<String, ProviderError>> = responses
            .into_iter()
            .map(|s| Ok(s.into()))
            .collect();
        // The last scripted response repeats once the queue drains.
        let fallback = queue.pop_back().unwrap_or(Ok(String::new()));
        Self {
            queue: Mutex::new(queue),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Err(ProviderError::Malformed("scripted failure".into())),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedModel {
    async fn complete(&self, _request: &ModelRequest) -> Result<ModelOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut queue = self.queue.lock().unwrap();
            queue.pop_front().unwrap_or_else(|| self.fallback.clone())
        };
        next.map(|text| ModelOutput {
            text,
            usage: TokenUsage {
                tokens_in: 10,
                tokens_out: 10,
            },
        })
    }
}

/// A search provider that always returns no hits.
pub struct NullSearch;

#[async_trait]
impl SearchProvider for NullSearch {
    async fn search(
        &self,
        _query: &str,
        _max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        Ok(Vec::new())
    }
}

/// A search provider returning the same fixed hits for every query.
pub struct FixedSearch {
    pub hits: Vec<SearchHit>,
    pub calls: AtomicUsize,
}

impl FixedSearch {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            hits: urls
                .iter()
                .map(|u| SearchHit {
                    url: (*u).to_string(),
                    title: format!("title for {u}"),
                    snippet: format!("snippet for {u}"),
                })
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for FixedSearch {
    async fn search(
        &self,
        _query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.iter().take(max_results).cloned().collect())
    }
}

/// A fetcher that always reports the page as missing.
pub struct NullFetcher;

#[async_trait]
impl PageFetcher for NullFetcher {
    async fn fetch(
        &self,
        url: &str,
        _headers: &[(String, String)],
        _timeout: Duration,
    ) -> Result<FetchedPage, ProviderError> {
        Ok(FetchedPage {
            status_code: 404,
            body: Vec::new(),
            final_url: url.to_string(),
        })
    }
}

/// A fetcher serving bodies from an in-memory map, counting per-URL hits.
pub struct MapFetcher {
    pages: HashMap<String, String>,
    pub fetches: Mutex<HashMap<String, usize>>,
}

impl MapFetcher {
    pub fn new(pages: &[(&str, &str)]) -> Self {
        Self {
            pages: pages
                .iter()
                .map(|(u, b)| ((*u).to_string(), (*b).to_string()))
                .collect(),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        *self.fetches.lock().unwrap().get(url).unwrap_or(&0)
    }
}

#[async_trait]
impl PageFetcher for MapFetcher {
    async fn fetch(
        &self,
        url: &str,
        _headers: &[(String, String)],
        _timeout: Duration,
    ) -> Result<FetchedPage, ProviderError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        match self.pages.get(url) {
            Some(body) => Ok(FetchedPage {
                status_code: 200,
                body: body.clone().into_bytes(),
                final_url: url.to_string(),
            }),
            None => Ok(FetchedPage {
                status_code: 404,
                body: Vec::new(),
                final_url: url.to_string(),
            }),
        }
    }
}

/// A fetcher that blocks every request with the given status.
pub struct BlockedFetcher(pub u16);

#[async_trait]
impl PageFetcher for BlockedFetcher {
    async fn fetch(
        &self,
        url: &str,
        _headers: &[(String, String)],
        _timeout: Duration,
    ) -> Result<FetchedPage, ProviderError> {
        Ok(FetchedPage {
            status_code: self.0,
            body: Vec::new(),
            final_url: url.to_string(),
        })
    }
}
