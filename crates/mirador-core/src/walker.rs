//! Pagination walker over the upstream list endpoint.

use std::collections::HashSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::AppError;
use crate::traits::UpstreamClient;

/// Identifiers observed by one walk of the list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedIds {
    /// Deduplicated, in first-seen order.
    pub ids: Vec<i64>,
    /// True only if the walk reached the end of the listing.
    ///
    /// The staleness sweep must not run on an incomplete set.
    pub complete: bool,
    pub pages: u32,
}

/// Walks the list endpoint page by page until it is exhausted.
pub struct PaginationWalker<'a, U: UpstreamClient> {
    client: &'a U,
    page_size: u32,
    max_pages: u32,
    delay: Duration,
    cancel: &'a CancellationToken,
}

impl<'a, U: UpstreamClient> PaginationWalker<'a, U> {
    pub fn new(client: &'a U, config: &SyncConfig, cancel: &'a CancellationToken) -> Self {
        Self {
            client,
            page_size: config.page_size.clamp(1, 50),
            max_pages: config.max_pages.max(1),
            delay: config.delay_between_requests(),
            cancel,
        }
    }

    /// Collects every identifier currently listed upstream.
    ///
    /// Stops on an empty page, on metadata saying there is no next page, or,
    /// without metadata, on a page shorter than the page size.
    ///
    /// # Errors
    ///
    /// - `AppError::UpstreamUnavailable` if the first page fails after retries
    ///   with a transient error.
    /// - Terminal errors (auth, unexpected status) on any page propagate as-is.
    ///
    /// A transient failure after the first page ends the walk early with
    /// `complete = false` and the ids gathered so far.
    pub async fn collect_all_ids(&self) -> Result<CollectedIds, AppError> {
        let mut seen = HashSet::new();
        let mut collected = CollectedIds::default();
        let mut page = 1u32;

        loop {
            if self.cancel.is_cancelled() {
                info!(page, "Listing walk cancelled");
                return Ok(collected);
            }

            let listing = match self.client.list_page(page, self.page_size, self.cancel).await {
                Ok(listing) => listing,
                Err(AppError::Cancelled) => return Ok(collected),
                Err(e) if page == 1 && e.is_retryable() => {
                    return Err(AppError::UpstreamUnavailable(e.to_string()));
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        page,
                        collected = collected.ids.len(),
                        error = %e,
                        "Listing walk ended early, keeping partial results"
                    );
                    return Ok(collected);
                }
                Err(e) => return Err(e),
            };

            collected.pages = page;
            // Short-page detection counts what upstream sent, not what parsed.
            let count = listing.raw_len;
            for summary in listing.items {
                if seen.insert(summary.id) {
                    collected.ids.push(summary.id);
                }
            }
            debug!(page, count, has_more = ?listing.has_more, "Fetched listing page");

            self.pause().await;

            let exhausted = count == 0
                || match listing.has_more {
                    Some(has_more) => !has_more,
                    None => count < self.page_size as usize,
                };
            if exhausted {
                collected.complete = true;
                info!(
                    pages = page,
                    ids = collected.ids.len(),
                    "Listing walk complete"
                );
                return Ok(collected);
            }

            if page >= self.max_pages {
                warn!(
                    max_pages = self.max_pages,
                    "Listing walk hit page limit, treating listing as incomplete"
                );
                return Ok(collected);
            }
            page += 1;
        }
    }

    async fn pause(&self) {
        if self.delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.delay) => {}
        }
    }
}
