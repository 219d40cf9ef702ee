//! Category classification and the recency window.

use std::collections::{BTreeMap, HashSet};

use chrono::{Days, NaiveDate};
use reorder_adapters::ContactDirectory;
use reorder_core::{Category, Client, LastPurchase, ReportRow};

use crate::config::ConfigError;

/// Maps price-list ids to a category. The two sets are disjoint.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    distributor: HashSet<String>,
    wholesaler: HashSet<String>,
}

impl Classifier {
    pub fn new(
        distributor: impl IntoIterator<Item = String>,
        wholesaler: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let distributor: HashSet<String> = distributor.into_iter().collect();
        let wholesaler: HashSet<String> = wholesaler.into_iter().collect();
        let mut overlap: Vec<&String> = distributor.intersection(&wholesaler).collect();
        overlap.sort();
        if let Some(id) = overlap.first() {
            return Err(ConfigError::Overlap((*id).clone()));
        }
        Ok(Self {
            distributor,
            wholesaler,
        })
    }

    pub fn category_from_price(&self, price_list_id: Option<&str>) -> Option<Category> {
        let id = price_list_id?;
        if self.distributor.contains(id) {
            Some(Category::Distributor)
        } else if self.wholesaler.contains(id) {
            Some(Category::Wholesaler)
        } else {
            None
        }
    }
}

/// Price list on the sale itself, else the client's directory default.
pub fn resolve_price_list<'a>(
    sale_price_list: Option<&'a str>,
    client: &'a Client,
) -> Option<&'a str> {
    sale_price_list.or(client.default_price_list_id.as_deref())
}

/// Months are approximated as 30 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecencyWindow {
    pub max_months: u32,
}

impl Default for RecencyWindow {
    fn default() -> Self {
        Self { max_months: 6 }
    }
}

impl RecencyWindow {
    pub const DAYS_PER_MONTH: u64 = 30;

    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.max_months) * Self::DAYS_PER_MONTH))
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn contains(&self, last_purchase: NaiveDate, today: NaiveDate) -> bool {
        last_purchase >= self.cutoff(today)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    UnknownClient,
    NoCategory,
    OutsideWindow,
}

#[derive(Debug, Clone, Default)]
pub struct Classified {
    pub rows: Vec<ReportRow>,
    pub excluded: Vec<(String, Exclusion)>,
}

/// Turns last purchases into report rows, dropping clients that are unknown,
/// uncategorized, or outside the window.
pub fn build_report_rows(
    last_purchases: &BTreeMap<String, LastPurchase>,
    directory: &ContactDirectory,
    classifier: &Classifier,
    window: RecencyWindow,
    today: NaiveDate,
) -> Classified {
    let mut out = Classified::default();
    for (client_id, purchase) in last_purchases {
        let Some(client) = directory.get(client_id) else {
            out.excluded.push((client_id.clone(), Exclusion::UnknownClient));
            continue;
        };

        let price_list = resolve_price_list(purchase.price_list_id.as_deref(), client);
        let (Some(category), Some(price_list)) =
            (classifier.category_from_price(price_list), price_list)
        else {
            out.excluded.push((client_id.clone(), Exclusion::NoCategory));
            continue;
        };

        if !window.contains(purchase.date, today) {
            out.excluded.push((client_id.clone(), Exclusion::OutsideWindow));
            continue;
        }

        out.rows.push(ReportRow {
            client_id: client_id.clone(),
            name: client.display_name.clone(),
            email: client.email.clone(),
            city: client.city.clone(),
            state: client.state.clone(),
            category,
            price_list_id: price_list.to_string(),
            last_purchase_date: purchase.date,
            days_since_purchase: (today - purchase.date).num_days(),
        });
    }
    out
}
