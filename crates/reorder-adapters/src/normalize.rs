//! Raw sale events to canonical [`Sale`] records, plus two-layer dedup.

use std::collections::HashSet;

use chrono::NaiveDate;
use reorder_core::{Sale, SaleKey, SaleKind};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::{ref_id, RawId, RawRef};

#[derive(Debug, Deserialize)]
struct RawSaleEvent {
    #[serde(default)]
    id: Option<RawId>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    client: Option<RawRef>,
    #[serde(default, rename = "priceList")]
    price_list: Option<RawRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("event is not an object: {0}")]
    Malformed(String),
    #[error("event has no id")]
    MissingId,
    #[error("event {0} has no client id")]
    MissingClient(String),
    #[error("event {id} has unparseable date `{raw}`")]
    BadDate { id: String, raw: String },
}

/// Calendar date of an ISO date or date-time string.
pub fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

pub fn normalize_sale(kind: SaleKind, raw: &JsonValue) -> Result<Sale, RejectReason> {
    let event: RawSaleEvent = serde_json::from_value(raw.clone())
        .map_err(|err| RejectReason::Malformed(err.to_string()))?;

    let source_id = event
        .id
        .map(|id| id.0)
        .filter(|id| !id.is_empty())
        .ok_or(RejectReason::MissingId)?;
    let client_id = ref_id(event.client.as_ref())
        .ok_or_else(|| RejectReason::MissingClient(source_id.clone()))?;
    let raw_date = event.date.unwrap_or_default();
    let date = parse_event_date(&raw_date).ok_or_else(|| RejectReason::BadDate {
        id: source_id.clone(),
        raw: raw_date.clone(),
    })?;

    Ok(Sale {
        source_id,
        kind,
        client_id,
        date,
        price_list_id: ref_id(event.price_list.as_ref()),
    })
}

/// Canonical sales of one collection, in encounter order.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub sales: Vec<Sale>,
    pub rejected: usize,
}

pub fn normalize_events(kind: SaleKind, raw: &[JsonValue]) -> Normalized {
    let mut out = Normalized::default();
    for item in raw {
        match normalize_sale(kind, item) {
            Ok(sale) => out.sales.push(sale),
            Err(reason) => {
                warn!(kind = kind.as_str(), %reason, "rejected raw sale event");
                out.rejected += 1;
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct Deduped {
    pub accepted: Vec<Sale>,
    pub skipped_existing: usize,
    pub duplicates: usize,
}

/// Drops sales whose key is already stored, then repeated keys within the
/// batch, keeping the first occurrence.
pub fn dedupe_sales(candidates: Vec<Sale>, existing: &HashSet<SaleKey>) -> Deduped {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut out = Deduped::default();
    for sale in candidates {
        let key = sale.key();
        if existing.contains(&key) {
            out.skipped_existing += 1;
        } else if !seen.insert(key) {
            out.duplicates += 1;
        } else {
            out.accepted.push(sale);
        }
    }
    out
}
