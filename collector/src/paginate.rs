use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::client::{ListPage, PageSource};
use crate::config::RetryConfig;
use crate::error::{CollectorError, CollectorResult};

/// Lazily walks a paginated listing, following continuation cursors.
///
/// Every item of the buffered page is yielded before the next page is
/// requested. Transient faults on a cursor hop are retried with exponential
/// backoff; the retry budget applies per hop, not across the traversal.
/// A traversal that exhausts its budget is incomplete and must not be
/// stored.
pub struct PagedRows<'a> {
    source: &'a dyn PageSource,
    buffer: VecDeque<Value>,
    next_link: Option<String>,
    retry: RetryConfig,
    limiter: Option<Arc<Semaphore>>
}

impl<'a> PagedRows<'a> {
    pub fn new(
        source: &'a dyn PageSource,
        initial: ListPage,
        retry: RetryConfig,
        limiter: Option<Arc<Semaphore>>
    ) -> Self {
        Self {
            source,
            buffer: initial.value.into(),
            next_link: initial.odata_next_link,
            retry,
            limiter
        }
    }

    /// Yields the next item in page order, fetching the next page once the
    /// current one is exhausted. `None` means the listing is complete.
    pub async fn try_next(&mut self) -> CollectorResult<Option<Value>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            let Some(next_link) = self.next_link.take() else {
                return Ok(None);
            };
            let page = self.fetch_with_retry(&next_link).await?;
            self.buffer = page.value.into();
            self.next_link = page.odata_next_link;
            if self.buffer.is_empty() && self.next_link.is_none() {
                return Ok(None);
            }
        }
    }

    /// Drains the remaining items into a vector.
    pub async fn collect_rows(&mut self) -> CollectorResult<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(item) = self.try_next().await? {
            rows.push(item);
        }
        Ok(rows)
    }

    async fn fetch_with_retry(&self, url: &str) -> CollectorResult<ListPage> {
        let mut attempt: u32 = 0;
        loop {
            let result = match &self.limiter {
                Some(limiter) => {
                    let _permit = limiter.acquire().await.expect("request limiter closed");
                    self.source.fetch_page(url).await
                }
                None => self.source.fetch_page(url).await
            };

            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt > self.retry.max_retries {
                        error!(error = %e, "Max retries exceeded for pagination");
                        return Err(CollectorError::RetryExhausted {
                            attempts: self.retry.max_retries,
                            message: e.to_string()
                        });
                    }
                    let wait = backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        wait_secs = wait.as_secs(),
                        error = %e,
                        "Connection error during pagination, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    error!(error = %e, "Unexpected error during pagination");
                    return Err(e);
                }
            }
        }
    }
}

/// Exponential backoff, capped at 30 seconds.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(31));
    Duration::from_secs(exp.min(30))
}
