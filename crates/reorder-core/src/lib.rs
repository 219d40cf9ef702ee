//! Core domain model for the client reorder watch.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Cursor value used when no sync has ever been recorded.
pub fn sync_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// The two transaction types tracked for "last purchase" purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleKind {
    Invoice,
    Remission,
}

impl SaleKind {
    pub const ALL: [SaleKind; 2] = [SaleKind::Invoice, SaleKind::Remission];

    pub fn as_str(&self) -> &'static str {
        match self {
            SaleKind::Invoice => "invoice",
            SaleKind::Remission => "remission",
        }
    }
}

impl fmt::Display for SaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSaleKind(pub String);

impl fmt::Display for UnknownSaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sale kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownSaleKind {}

impl FromStr for SaleKind {
    type Err = UnknownSaleKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice" => Ok(SaleKind::Invoice),
            "remission" => Ok(SaleKind::Remission),
            other => Err(UnknownSaleKind(other.to_string())),
        }
    }
}

/// Identity of a stored sale. At most one stored record exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SaleKey {
    pub source_id: String,
    pub kind: SaleKind,
}

impl SaleKey {
    pub fn new(source_id: impl Into<String>, kind: SaleKind) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
        }
    }
}

impl fmt::Display for SaleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.source_id, self.kind)
    }
}

/// Canonical sale event, normalized from an invoice or a remission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub source_id: String,
    pub kind: SaleKind,
    pub client_id: String,
    pub date: NaiveDate,
    pub price_list_id: Option<String>,
}

impl Sale {
    pub fn key(&self) -> SaleKey {
        SaleKey::new(self.source_id.clone(), self.kind)
    }

    pub fn rank(&self) -> RecencyRank<'_> {
        RecencyRank {
            date: self.date,
            source_id: &self.source_id,
            kind: self.kind,
        }
    }
}

/// Total order used to pick the most recent sale of a client.
///
/// Dates compare first. Equal dates fall back to the source id, compared
/// numeric-aware (a longer id is a larger number, then lexical), and finally
/// `remission` ranks above `invoice`. Every aggregation path uses this order so
/// the outcome never depends on the order in which sales were encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecencyRank<'a> {
    pub date: NaiveDate,
    pub source_id: &'a str,
    pub kind: SaleKind,
}

impl Ord for RecencyRank<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .cmp(&other.date)
            .then_with(|| self.source_id.len().cmp(&other.source_id.len()))
            .then_with(|| self.source_id.cmp(other.source_id))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for RecencyRank<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Most recent purchase of one client, derived from its sales.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPurchase {
    pub client_id: String,
    pub date: NaiveDate,
    pub price_list_id: Option<String>,
    pub source_id: String,
    pub kind: SaleKind,
}

impl LastPurchase {
    pub fn from_sale(sale: &Sale) -> Self {
        Self {
            client_id: sale.client_id.clone(),
            date: sale.date,
            price_list_id: sale.price_list_id.clone(),
            source_id: sale.source_id.clone(),
            kind: sale.kind,
        }
    }

    pub fn rank(&self) -> RecencyRank<'_> {
        RecencyRank {
            date: self.date,
            source_id: &self.source_id,
            kind: self.kind,
        }
    }
}

/// Directory snapshot of a client. Missing text fields are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub display_name: String,
    pub email: String,
    pub default_price_list_id: Option<String>,
    pub city: String,
    pub state: String,
}

/// Business category a client falls into by price list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Distribuidores")]
    Distributor,
    #[serde(rename = "Mayoristas")]
    Wholesaler,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Distributor => "Distribuidores",
            Category::Wholesaler => "Mayoristas",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Distribuidores" => Ok(Category::Distributor),
            "Mayoristas" => Ok(Category::Wholesaler),
            other => Err(format!("unknown category `{other}`")),
        }
    }
}

/// Summary row kept in the report store, one per client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub client_id: String,
    pub name: String,
    pub email: String,
    pub city: String,
    pub state: String,
    pub category: Category,
    pub price_list_id: String,
    pub last_purchase_date: NaiveDate,
    pub days_since_purchase: i64,
}
