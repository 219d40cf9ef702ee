//! Store contracts consumed by the sync engine.
//!
//! Three independent stores back a run: the durable sale log, the report
//! keyed by client, and the single-value sync cursor. Writes across them are
//! not transactional; the engine orders its calls so a failed run can be
//! retried from the previous cursor.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use reorder_core::{LastPurchase, ReportRow, Sale, SaleKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Backend(String),
}

/// Durable record of every ingested sale, keyed by `(source_id, kind)`.
#[async_trait]
pub trait SaleStore: Send + Sync {
    /// Returns the subset of `keys` already stored.
    async fn exists(&self, keys: &[SaleKey]) -> Result<HashSet<SaleKey>, StoreError>;

    /// Inserts or overwrites sales by key, in sequential chunks.
    ///
    /// A failure partway leaves earlier chunks applied. Returns the number of
    /// distinct keys written.
    async fn upsert(&self, sales: &[Sale]) -> Result<usize, StoreError>;

    /// Most recent sale per client, optionally restricted to `clients`.
    ///
    /// "Most recent" follows [`reorder_core::RecencyRank`].
    async fn last_purchase_per_client(
        &self,
        clients: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, LastPurchase>, StoreError>;

    async fn delete_all(&self) -> Result<u64, StoreError>;
}

/// Report rows keyed by client id.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn upsert(&self, rows: &[ReportRow]) -> Result<usize, StoreError>;

    /// All rows ordered by client id.
    async fn read_all(&self) -> Result<Vec<ReportRow>, StoreError>;

    async fn delete(&self, client_ids: &[String]) -> Result<u64, StoreError>;

    async fn delete_all(&self) -> Result<u64, StoreError>;
}

/// Date the next incremental run resumes from.
#[async_trait]
pub trait SyncCursor: Send + Sync {
    async fn get(&self) -> Result<Option<NaiveDate>, StoreError>;

    async fn set(&self, date: NaiveDate) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// The three stores a run reads and writes.
#[derive(Clone)]
pub struct Stores {
    pub sales: Arc<dyn SaleStore>,
    pub reports: Arc<dyn ReportStore>,
    pub cursor: Arc<dyn SyncCursor>,
}

impl Stores {
    pub fn new(
        sales: Arc<dyn SaleStore>,
        reports: Arc<dyn ReportStore>,
        cursor: Arc<dyn SyncCursor>,
    ) -> Self {
        Self {
            sales,
            reports,
            cursor,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(crate::MemorySaleStore::default()),
            Arc::new(crate::MemoryReportStore::default()),
            Arc::new(crate::MemorySyncCursor::default()),
        )
    }

    pub fn postgres(pool: sqlx::PgPool, chunk_size: usize) -> Self {
        Self::new(
            Arc::new(crate::PgSaleStore::new(pool.clone(), chunk_size)),
            Arc::new(crate::PgReportStore::new(pool.clone(), chunk_size)),
            Arc::new(crate::PgSyncCursor::new(pool)),
        )
    }
}

/// Drops repeated keys, keeping the first occurrence.
pub(crate) fn first_per_key(sales: &[Sale]) -> Vec<&Sale> {
    let mut seen = HashSet::with_capacity(sales.len());
    sales.iter().filter(|sale| seen.insert(sale.key())).collect()
}
