//! Offset pagination over a [`PageSource`].
//!
//! A sequence ends on an empty page, a short page, the optional item cap, or
//! the first fetch error. The last case is reported as `truncated` so callers
//! never mistake a failed walk for an exhausted source.

use std::time::Duration;

use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{Endpoint, PageQuery, PageSource};

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub page_size: usize,
    pub page_delay: Duration,
    pub max_items: Option<usize>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            page_delay: Duration::from_millis(100),
            max_items: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    Open,
    Exhausted,
    Capped,
    Truncated,
}

/// Lazy page walk; each call to [`Paginator::next_page`] issues one request.
pub struct Paginator<'a> {
    source: &'a dyn PageSource,
    endpoint: Endpoint,
    since: Option<NaiveDate>,
    config: PaginationConfig,
    offset: usize,
    yielded: usize,
    state: WalkState,
}

/// Everything a walk produced, plus how it ended.
#[derive(Debug, Clone, Default)]
pub struct Drained {
    pub items: Vec<JsonValue>,
    pub truncated: bool,
    pub capped: bool,
}

impl<'a> Paginator<'a> {
    pub fn new(
        source: &'a dyn PageSource,
        endpoint: Endpoint,
        since: Option<NaiveDate>,
        config: PaginationConfig,
    ) -> Self {
        let state = if config.max_items == Some(0) {
            WalkState::Capped
        } else {
            WalkState::Open
        };
        Self {
            source,
            endpoint,
            since,
            config,
            offset: 0,
            yielded: 0,
            state,
        }
    }

    pub fn truncated(&self) -> bool {
        self.state == WalkState::Truncated
    }

    pub fn capped(&self) -> bool {
        self.state == WalkState::Capped
    }

    pub async fn next_page(&mut self) -> Option<Vec<JsonValue>> {
        if self.state != WalkState::Open {
            return None;
        }

        let page_size = self.config.page_size.max(1);
        if self.offset > 0 && !self.config.page_delay.is_zero() {
            tokio::time::sleep(self.config.page_delay).await;
        }

        let query = PageQuery {
            offset: self.offset,
            limit: page_size,
            since: self.since,
        };
        let mut page = match self.source.fetch_page(self.endpoint, &query).await {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    endpoint = self.endpoint.path(),
                    offset = self.offset,
                    yielded = self.yielded,
                    error = %err,
                    "pagination stopped early; returning partial results"
                );
                self.state = WalkState::Truncated;
                return None;
            }
        };

        if page.is_empty() {
            self.state = WalkState::Exhausted;
            return None;
        }

        let short_page = page.len() < page_size;
        if let Some(max_items) = self.config.max_items {
            let remaining = max_items.saturating_sub(self.yielded);
            if page.len() >= remaining {
                page.truncate(remaining);
                self.state = WalkState::Capped;
            }
        }
        if short_page && self.state == WalkState::Open {
            self.state = WalkState::Exhausted;
        }

        self.yielded += page.len();
        self.offset += page_size;
        debug!(
            endpoint = self.endpoint.path(),
            offset = self.offset,
            fetched = page.len(),
            "page fetched"
        );
        Some(page)
    }

    pub async fn drain(mut self) -> Drained {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await {
            items.extend(page);
        }
        Drained {
            items,
            truncated: self.truncated(),
            capped: self.capped(),
        }
    }
}
