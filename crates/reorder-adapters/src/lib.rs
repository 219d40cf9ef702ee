//! Remote source contracts, pagination and ingestion-boundary normalization.

pub mod contacts;
pub mod fixture;
pub mod normalize;
pub mod paginate;

use async_trait::async_trait;
use chrono::NaiveDate;
use reorder_core::SaleKind;
use reorder_storage::{BasicAuth, FetchError, HttpFetcher};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use contacts::{load_contact_directory, ContactDirectory};
pub use fixture::{load_fixture_bundle, FixtureBundle, FixturePageSource};
pub use normalize::{dedupe_sales, normalize_events, Deduped, Normalized, RejectReason};
pub use paginate::{Drained, PaginationConfig, Paginator};

/// Collections exposed by the remote system of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Invoices,
    Remissions,
    Contacts,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Invoices => "invoices",
            Endpoint::Remissions => "remissions",
            Endpoint::Contacts => "contacts",
        }
    }

    pub fn for_kind(kind: SaleKind) -> Self {
        match kind {
            SaleKind::Invoice => Endpoint::Invoices,
            SaleKind::Remission => Endpoint::Remissions,
        }
    }
}

/// One page request: offset/limit plus the optional date lower bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub offset: usize,
    pub limit: usize,
    pub since: Option<NaiveDate>,
}

impl PageQuery {
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("start".to_string(), self.offset.to_string()),
            ("limit".to_string(), self.limit.to_string()),
        ];
        if let Some(since) = self.since {
            pairs.push(("date[from]".to_string(), since.format("%Y-%m-%d").to_string()));
        }
        pairs
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A paginated collection source. Implementations return one raw page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        query: &PageQuery,
    ) -> Result<Vec<JsonValue>, FetchError>;
}

/// HTTP-backed source for the remote API.
#[derive(Debug)]
pub struct RemoteApiSource {
    http: HttpFetcher,
    base_url: String,
    auth: Option<BasicAuth>,
}

impl RemoteApiSource {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        auth: Option<BasicAuth>,
    ) -> Result<Self, AdapterError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(AdapterError::Message("remote API base url is empty".to_string()));
        }
        Ok(Self {
            http,
            base_url,
            auth,
        })
    }

    pub fn endpoint_url(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url, endpoint.path())
    }
}

#[async_trait]
impl PageSource for RemoteApiSource {
    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        query: &PageQuery,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let body = self
            .http
            .get_json(&self.endpoint_url(endpoint), &query.to_pairs(), self.auth.as_ref())
            .await?;
        Ok(serde_json::from_value(body)?)
    }
}

/// Identifier that the remote sends either as a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawId(pub String);

impl<'de> Deserialize<'de> for RawId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(serde_json::Number),
            Text(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Number(n) => RawId(n.to_string()),
            Repr::Text(s) => RawId(s.trim().to_string()),
        })
    }
}

/// Nested `{ "id": .. }` reference such as `client` or `priceList`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRef {
    #[serde(default)]
    pub id: Option<RawId>,
}

/// Id of an optional nested reference; blank ids count as absent.
pub fn ref_id(reference: Option<&RawRef>) -> Option<String> {
    reference
        .and_then(|r| r.id.as_ref())
        .map(|id| id.0.clone())
        .filter(|id| !id.is_empty())
}
