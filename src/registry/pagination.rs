//! Lazy, restartable tag pagination over an injectable page source

use crate::error::{Result, SyncerError};
use async_trait::async_trait;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// One page of tags and the URL of the next page, if any
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPage {
    pub tags: Vec<String>,
    pub next: Option<String>,
}

/// Fetches a single page of tags by URL
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str, cancel: &CancellationToken) -> Result<TagPage>;
}

/// Walks a paginated tag listing one page at a time.
///
/// Cancellation is checked before every fetch. A cursor pointing back at an
/// already fetched URL is rejected instead of looping forever.
pub struct TagPager<'a> {
    source: &'a dyn PageSource,
    first_url: String,
    next_url: Option<String>,
    seen: HashSet<String>,
}

impl<'a> TagPager<'a> {
    pub fn new(source: &'a dyn PageSource, first_url: impl Into<String>) -> Self {
        let first_url = first_url.into();
        Self {
            source,
            next_url: Some(first_url.clone()),
            first_url,
            seen: HashSet::new(),
        }
    }

    /// Fetch the next page, or `None` once the listing is exhausted
    pub async fn next_page(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<String>>> {
        let Some(url) = self.next_url.take() else {
            return Ok(None);
        };

        if cancel.is_cancelled() {
            self.next_url = Some(url);
            return Err(SyncerError::Cancelled);
        }

        if !self.seen.insert(url.clone()) {
            return Err(SyncerError::Decode(format!(
                "pagination cursor repeats already fetched page {}",
                url
            )));
        }

        let page = self.source.fetch_page(&url, cancel).await?;
        self.next_url = page.next.filter(|next| !next.is_empty());
        Ok(Some(page.tags))
    }

    /// Start over from the first page
    pub fn restart(&mut self) {
        self.next_url = Some(self.first_url.clone());
        self.seen.clear();
    }

    pub fn pages_fetched(&self) -> usize {
        self.seen.len()
    }

    /// Drain every remaining page, preserving page and in-page order
    pub async fn collect_all(&mut self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        while let Some(page) = self.next_page(cancel).await? {
            tags.extend(page);
        }
        Ok(tags)
    }
}
