//! Postgres store backends.
//!
//! Batch writes bind one array per column and `UNNEST` them, one statement per
//! chunk. Chunks run sequentially outside a transaction.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use reorder_core::{Category, LastPurchase, ReportRow, Sale, SaleKey, SaleKind};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::store::{first_per_key, ReportStore, SaleStore, StoreError, SyncCursor};

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

fn parse_kind(raw: &str) -> Result<SaleKind, StoreError> {
    raw.parse()
        .map_err(|err: reorder_core::UnknownSaleKind| StoreError::Backend(err.to_string()))
}

#[derive(Debug, Clone)]
pub struct PgSaleStore {
    pool: PgPool,
    chunk_size: usize,
}

impl PgSaleStore {
    pub fn new(pool: PgPool, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl SaleStore for PgSaleStore {
    async fn exists(&self, keys: &[SaleKey]) -> Result<HashSet<SaleKey>, StoreError> {
        let mut found = HashSet::new();
        for chunk in keys.chunks(self.chunk_size) {
            let ids: Vec<String> = chunk.iter().map(|k| k.source_id.clone()).collect();
            let kinds: Vec<String> = chunk.iter().map(|k| k.kind.to_string()).collect();
            let rows = sqlx::query(
                "SELECT s.sale_id, s.sale_type
                 FROM sales_processed s
                 JOIN UNNEST($1::text[], $2::text[]) AS k(sale_id, sale_type)
                   ON s.sale_id = k.sale_id AND s.sale_type = k.sale_type",
            )
            .bind(&ids)
            .bind(&kinds)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let sale_id: String = row.try_get("sale_id")?;
                let sale_type: String = row.try_get("sale_type")?;
                found.insert(SaleKey::new(sale_id, parse_kind(&sale_type)?));
            }
        }
        Ok(found)
    }

    async fn upsert(&self, sales: &[Sale]) -> Result<usize, StoreError> {
        let unique = first_per_key(sales);
        for (index, chunk) in unique.chunks(self.chunk_size).enumerate() {
            let ids: Vec<String> = chunk.iter().map(|s| s.source_id.clone()).collect();
            let kinds: Vec<String> = chunk.iter().map(|s| s.kind.to_string()).collect();
            let clients: Vec<String> = chunk.iter().map(|s| s.client_id.clone()).collect();
            let dates: Vec<NaiveDate> = chunk.iter().map(|s| s.date).collect();
            let price_lists: Vec<Option<String>> =
                chunk.iter().map(|s| s.price_list_id.clone()).collect();

            sqlx::query(
                "INSERT INTO sales_processed
                   (sale_id, sale_type, client_id, sale_date, price_list_id)
                 SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::date[], $5::text[])
                 ON CONFLICT (sale_id, sale_type) DO UPDATE SET
                   client_id = EXCLUDED.client_id,
                   sale_date = EXCLUDED.sale_date,
                   price_list_id = EXCLUDED.price_list_id",
            )
            .bind(&ids)
            .bind(&kinds)
            .bind(&clients)
            .bind(&dates)
            .bind(&price_lists)
            .execute(&self.pool)
            .await?;
            debug!(chunk = index, rows = chunk.len(), "sales chunk upserted");
        }
        Ok(unique.len())
    }

    async fn last_purchase_per_client(
        &self,
        clients: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, LastPurchase>, StoreError> {
        let filter: Option<Vec<String>> = clients.map(|set| set.iter().cloned().collect());
        let rows = sqlx::query(
            "SELECT DISTINCT ON (client_id) client_id, sale_date, price_list_id, sale_id, sale_type
             FROM sales_processed
             WHERE $1::text[] IS NULL OR client_id = ANY($1)
             ORDER BY client_id,
                      sale_date DESC,
                      length(sale_id) DESC,
                      sale_id COLLATE \"C\" DESC,
                      sale_type COLLATE \"C\" DESC",
        )
        .bind(filter)
        .fetch_all(&self.pool)
        .await?;

        let mut last = BTreeMap::new();
        for row in rows {
            let purchase = LastPurchase {
                client_id: row.try_get("client_id")?,
                date: row.try_get("sale_date")?,
                price_list_id: row.try_get("price_list_id")?,
                source_id: row.try_get("sale_id")?,
                kind: parse_kind(&row.try_get::<String, _>("sale_type")?)?,
            };
            last.insert(purchase.client_id.clone(), purchase);
        }
        Ok(last)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sales_processed")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
    chunk_size: usize,
}

impl PgReportStore {
    pub fn new(pool: PgPool, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }
}

fn report_row_from(row: &PgRow) -> Result<ReportRow, StoreError> {
    let category: String = row.try_get("category")?;
    Ok(ReportRow {
        client_id: row.try_get("client_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        category: category.parse::<Category>().map_err(StoreError::Backend)?,
        price_list_id: row.try_get("price_list_id")?,
        last_purchase_date: row.try_get("last_purchase_date")?,
        days_since_purchase: row.try_get("days_since_purchase")?,
    })
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn upsert(&self, rows: &[ReportRow]) -> Result<usize, StoreError> {
        for chunk in rows.chunks(self.chunk_size) {
            let ids: Vec<String> = chunk.iter().map(|r| r.client_id.clone()).collect();
            let names: Vec<String> = chunk.iter().map(|r| r.name.clone()).collect();
            let emails: Vec<String> = chunk.iter().map(|r| r.email.clone()).collect();
            let cities: Vec<String> = chunk.iter().map(|r| r.city.clone()).collect();
            let states: Vec<String> = chunk.iter().map(|r| r.state.clone()).collect();
            let categories: Vec<String> =
                chunk.iter().map(|r| r.category.label().to_string()).collect();
            let price_lists: Vec<String> = chunk.iter().map(|r| r.price_list_id.clone()).collect();
            let dates: Vec<NaiveDate> = chunk.iter().map(|r| r.last_purchase_date).collect();
            let days: Vec<i64> = chunk.iter().map(|r| r.days_since_purchase).collect();

            sqlx::query(
                "INSERT INTO client_last_purchase
                   (client_id, name, email, city, state, category, price_list_id,
                    last_purchase_date, days_since_purchase)
                 SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
                                      $6::text[], $7::text[], $8::date[], $9::bigint[])
                 ON CONFLICT (client_id) DO UPDATE SET
                   name = EXCLUDED.name,
                   email = EXCLUDED.email,
                   city = EXCLUDED.city,
                   state = EXCLUDED.state,
                   category = EXCLUDED.category,
                   price_list_id = EXCLUDED.price_list_id,
                   last_purchase_date = EXCLUDED.last_purchase_date,
                   days_since_purchase = EXCLUDED.days_since_purchase,
                   updated_at = now()",
            )
            .bind(&ids)
            .bind(&names)
            .bind(&emails)
            .bind(&cities)
            .bind(&states)
            .bind(&categories)
            .bind(&price_lists)
            .bind(&dates)
            .bind(&days)
            .execute(&self.pool)
            .await?;
        }
        Ok(rows.len())
    }

    async fn read_all(&self) -> Result<Vec<ReportRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT client_id, name, email, city, state, category, price_list_id,
                    last_purchase_date, days_since_purchase
             FROM client_last_purchase
             ORDER BY client_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(report_row_from).collect()
    }

    async fn delete(&self, client_ids: &[String]) -> Result<u64, StoreError> {
        let mut removed = 0;
        for chunk in client_ids.chunks(self.chunk_size) {
            let result = sqlx::query("DELETE FROM client_last_purchase WHERE client_id = ANY($1)")
                .bind(chunk)
                .execute(&self.pool)
                .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM client_last_purchase")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
pub struct PgSyncCursor {
    pool: PgPool,
}

impl PgSyncCursor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncCursor for PgSyncCursor {
    async fn get(&self) -> Result<Option<NaiveDate>, StoreError> {
        let date = sqlx::query_scalar::<_, NaiveDate>(
            "SELECT last_sync_date FROM sync_cursor WHERE singleton",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(date)
    }

    async fn set(&self, date: NaiveDate) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_cursor (singleton, last_sync_date, updated_at)
             VALUES (TRUE, $1, now())
             ON CONFLICT (singleton) DO UPDATE SET
               last_sync_date = EXCLUDED.last_sync_date,
               updated_at = now()",
        )
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_cursor")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
