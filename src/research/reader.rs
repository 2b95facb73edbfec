//! Read step: bounded concurrent page fetching
//!
//! Fetches a batch of URLs under the configured semaphore width, honoring
//! the per-fetch timeout and the run's cancellation token. Results come
//! back in submission order regardless of completion order, so downstream
//! findings stay deterministically ordered. A failed fetch never surfaces
//! an error; the page's status records the cause.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{default_fetch_headers, FetchedPage};
use crate::state::{PageContent, PageStatus};

use super::super::stages::RunContext;

/// Fetch `urls` concurrently and return one [`PageContent`] per URL, in
/// the order the URLs were submitted. URLs skipped by cancellation are
/// omitted from the result.
pub async fn read_pages(urls: Vec<String>, ctx: &RunContext) -> Vec<PageContent> {
    if urls.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(ctx.config.fetch_concurrency));
    let headers = Arc::new(default_fetch_headers());
    let fetch_timeout = ctx.config.fetch_timeout;
    let truncate_at = ctx.config.body_truncate_bytes;

    let mut handles = Vec::with_capacity(urls.len());
    for url in urls {
        let semaphore = Arc::clone(&semaphore);
        let headers = Arc::clone(&headers);
        let fetcher = Arc::clone(&ctx.fetcher);
        let cancel = ctx.cancel.clone();

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return None;
            };
            if cancel.is_cancelled() {
                return None;
            }

            // In-flight fetches are abandoned on cancellation; the body is
            // simply discarded.
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = timeout(fetch_timeout, fetcher.fetch(&url, &headers, fetch_timeout)) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(ProviderError::Timeout(fetch_timeout)),
                    }
                }
            };

            Some(page_from_result(&url, result, truncate_at))
        }));
    }

    // Collect in submission order, not completion order.
    let mut pages = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(Some(page)) => pages.push(page),
            Ok(None) => {}
            Err(join_err) => {
                debug!(error = %join_err, "fetch task aborted");
            }
        }
    }
    pages
}

fn page_from_result(
    url: &str,
    result: Result<FetchedPage, ProviderError>,
    truncate_at: usize,
) -> PageContent {
    match result {
        Ok(fetched) => match fetched.status_code {
            200..=299 => {
                let content_length = fetched.body.len();
                let truncated = content_length > truncate_at;
                let kept = if truncated {
                    &fetched.body[..truncate_at]
                } else {
                    &fetched.body[..]
                };
                let body = String::from_utf8_lossy(kept).into_owned();

                let mut page = PageContent::ok(url, body);
                page.content_length = content_length;
                page.bytes_truncated = truncated;
                page
            }
            401 | 403 | 429 => PageContent::failed(url, PageStatus::Blocked),
            _ => PageContent::failed(url, PageStatus::Error),
        },
        Err(err) => {
            debug!(url, error = %err, "page fetch failed");
            PageContent::failed(url, PageStatus::Error)
        }
    }
}
