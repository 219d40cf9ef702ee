//! Fixture-backed [`PageSource`] that emulates the remote API offline.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use reorder_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::normalize::parse_event_date;
use crate::{AdapterError, Endpoint, PageQuery, PageSource};

/// Raw collections as the remote would return them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub invoices: Vec<JsonValue>,
    #[serde(default)]
    pub remissions: Vec<JsonValue>,
    #[serde(default)]
    pub contacts: Vec<JsonValue>,
}

impl FixtureBundle {
    pub fn collection(&self, endpoint: Endpoint) -> &[JsonValue] {
        match endpoint {
            Endpoint::Invoices => &self.invoices,
            Endpoint::Remissions => &self.remissions,
            Endpoint::Contacts => &self.contacts,
        }
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle, AdapterError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let bundle =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(bundle)
}

/// Serves a [`FixtureBundle`] with offset/limit slicing and the `since`
/// filter applied to sale collections. Items whose date does not parse are
/// served unfiltered so ingestion can reject them.
#[derive(Debug)]
pub struct FixturePageSource {
    bundle: FixtureBundle,
    failures: HashMap<Endpoint, usize>,
    requests: AtomicUsize,
}

impl FixturePageSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle,
            failures: HashMap::new(),
            requests: AtomicUsize::new(0),
        }
    }

    /// Fail every request for `endpoint` at zero-based page `page_index`.
    pub fn failing_at_page(mut self, endpoint: Endpoint, page_index: usize) -> Self {
        self.failures.insert(endpoint, page_index);
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        query: &PageQuery,
    ) -> Result<Vec<JsonValue>, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let limit = query.limit.max(1);
        if self.failures.get(&endpoint) == Some(&(query.offset / limit)) {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: format!("fixture://{}?start={}", endpoint.path(), query.offset),
            });
        }

        let since = match endpoint {
            Endpoint::Contacts => None,
            _ => query.since,
        };
        Ok(self
            .bundle
            .collection(endpoint)
            .iter()
            .filter(|item| match (since, item.get("date").and_then(JsonValue::as_str)) {
                (Some(since), Some(raw)) => parse_event_date(raw).map_or(true, |d| d >= since),
                _ => true,
            })
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
