//! In-memory store backends for tests and offline fixture runs.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use reorder_core::{LastPurchase, ReportRow, Sale, SaleKey};
use tokio::sync::Mutex;

use crate::store::{first_per_key, ReportStore, SaleStore, StoreError, SyncCursor};

#[derive(Debug, Default)]
pub struct MemorySaleStore {
    sales: Mutex<BTreeMap<SaleKey, Sale>>,
}

impl MemorySaleStore {
    pub async fn len(&self) -> usize {
        self.sales.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sales.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<Sale> {
        self.sales.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl SaleStore for MemorySaleStore {
    async fn exists(&self, keys: &[SaleKey]) -> Result<HashSet<SaleKey>, StoreError> {
        let sales = self.sales.lock().await;
        Ok(keys
            .iter()
            .filter(|key| sales.contains_key(*key))
            .cloned()
            .collect())
    }

    async fn upsert(&self, sales: &[Sale]) -> Result<usize, StoreError> {
        let unique = first_per_key(sales);
        let mut stored = self.sales.lock().await;
        for sale in &unique {
            stored.insert(sale.key(), (*sale).clone());
        }
        Ok(unique.len())
    }

    async fn last_purchase_per_client(
        &self,
        clients: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, LastPurchase>, StoreError> {
        let sales = self.sales.lock().await;
        let mut last: BTreeMap<String, LastPurchase> = BTreeMap::new();
        for sale in sales.values() {
            if clients.is_some_and(|wanted| !wanted.contains(&sale.client_id)) {
                continue;
            }
            match last.get(&sale.client_id) {
                Some(current) if current.rank() >= sale.rank() => {}
                _ => {
                    last.insert(sale.client_id.clone(), LastPurchase::from_sale(sale));
                }
            }
        }
        Ok(last)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut sales = self.sales.lock().await;
        let removed = sales.len() as u64;
        sales.clear();
        Ok(removed)
    }
}

#[derive(Debug, Default)]
pub struct MemoryReportStore {
    rows: Mutex<BTreeMap<String, ReportRow>>,
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn upsert(&self, rows: &[ReportRow]) -> Result<usize, StoreError> {
        let mut stored = self.rows.lock().await;
        for row in rows {
            stored.insert(row.client_id.clone(), row.clone());
        }
        Ok(rows.len())
    }

    async fn read_all(&self) -> Result<Vec<ReportRow>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }

    async fn delete(&self, client_ids: &[String]) -> Result<u64, StoreError> {
        let mut stored = self.rows.lock().await;
        Ok(client_ids
            .iter()
            .filter(|id| stored.remove(*id).is_some())
            .count() as u64)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut stored = self.rows.lock().await;
        let removed = stored.len() as u64;
        stored.clear();
        Ok(removed)
    }
}

#[derive(Debug, Default)]
pub struct MemorySyncCursor {
    value: Mutex<Option<NaiveDate>>,
}

impl MemorySyncCursor {
    pub fn starting_at(date: NaiveDate) -> Self {
        Self {
            value: Mutex::new(Some(date)),
        }
    }
}

#[async_trait]
impl SyncCursor for MemorySyncCursor {
    async fn get(&self) -> Result<Option<NaiveDate>, StoreError> {
        Ok(*self.value.lock().await)
    }

    async fn set(&self, date: NaiveDate) -> Result<(), StoreError> {
        *self.value.lock().await = Some(date);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.value.lock().await = None;
        Ok(())
    }
}
