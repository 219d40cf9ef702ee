use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reorder_adapters::{Endpoint, FixtureBundle, FixturePageSource, PageSource, PaginationConfig};
use reorder_core::{Category, LastPurchase, ReportRow, Sale, SaleKey};
use reorder_storage::{
    MemoryReportStore, MemorySaleStore, MemorySyncCursor, ReportStore, SaleStore, StoreError,
    Stores, SyncCursor,
};
use reorder_sync::{
    Classifier, EngineConfig, RecencyWindow, RunMode, StaleRowPolicy, SyncPipeline,
};
use serde_json::{json, Value};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn today() -> NaiveDate {
    day(2024, 7, 1)
}

fn sale_event(id: &str, date: &str, client: &str, price_list: Option<&str>) -> Value {
    json!({
        "id": id,
        "date": date,
        "client": {"id": client},
        "priceList": price_list.map(|p| json!({"id": p})),
    })
}

fn contact(id: &str, price_list: Option<&str>) -> Value {
    json!({
        "id": id,
        "name": format!("Cliente {id}"),
        "email": format!("c{id}@example.com"),
        "priceList": price_list.map(|p| json!({"id": p})),
        "address": {"city": "Cali", "state": "Valle del Cauca"},
    })
}

fn contacts() -> Vec<Value> {
    vec![
        contact("1", Some("5")),
        contact("2", Some("4")),
        contact("3", Some("2")),
        contact("4", None),
        contact("6", None),
        contact("7", None),
    ]
}

fn sample_bundle() -> FixtureBundle {
    FixtureBundle {
        invoices: vec![
            sale_event("11", "2024-03-15", "1", Some("4")),
            sale_event("10", "2024-01-01T09:00:00-05:00", "1", Some("5")),
            sale_event("30", "2024-01-02", "3", None),
            sale_event("40", "2024-06-20", "4", None),
            sale_event("50", "2024-06-20", "5", Some("4")),
            sale_event("99", "2024-06-01", "6", Some("5")),
            sale_event("77", "2024-06-10", "7", Some("4")),
        ],
        remissions: vec![
            sale_event("20", "2024-01-03", "2", None),
            sale_event("100", "2024-06-01", "6", Some("4")),
            sale_event("77", "2024-06-10", "7", Some("2")),
        ],
        contacts: contacts(),
    }
}

fn classifier() -> Classifier {
    Classifier::new(
        ["4".to_string(), "3".to_string()],
        ["5".to_string(), "2".to_string()],
    )
    .unwrap()
}

fn engine() -> EngineConfig {
    let pagination = PaginationConfig {
        page_size: 2,
        page_delay: Duration::ZERO,
        max_items: None,
    };
    EngineConfig {
        sales_pagination: pagination.clone(),
        contacts_pagination: pagination,
        window: RecencyWindow { max_months: 6 },
        ..Default::default()
    }
}

fn pipeline_with(
    engine: EngineConfig,
    source: impl PageSource + 'static,
    stores: Stores,
    today: NaiveDate,
) -> SyncPipeline {
    SyncPipeline::new(engine, classifier(), Arc::new(source), stores).with_today(today)
}

fn pipeline(bundle: FixtureBundle, stores: Stores) -> SyncPipeline {
    pipeline_with(engine(), FixturePageSource::new(bundle), stores, today())
}

async fn report(stores: &Stores) -> BTreeMap<String, ReportRow> {
    stores
        .reports
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .map(|row| (row.client_id.clone(), row))
        .collect()
}

#[tokio::test]
async fn incremental_run_builds_the_report() {
    let stores = Stores::in_memory();
    let summary = pipeline(sample_bundle(), stores.clone())
        .run(RunMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.fetched_invoices, 7);
    assert_eq!(summary.fetched_remissions, 3);
    assert_eq!(summary.new_sales, 10);
    assert_eq!(summary.cursor_before, None);
    assert_eq!(summary.cursor_after, Some(today()));
    assert!(summary.truncated_endpoints.is_empty());

    let rows = report(&stores).await;
    assert_eq!(
        rows.keys().cloned().collect::<Vec<_>>(),
        vec!["1", "2", "6", "7"]
    );

    // max date wins and the sale's own price list beats the client default
    let one = &rows["1"];
    assert_eq!(one.last_purchase_date, day(2024, 3, 15));
    assert_eq!(one.category, Category::Distributor);
    assert_eq!(one.price_list_id, "4");
    assert_eq!(one.days_since_purchase, 108);
    assert_eq!(one.city, "Cali");

    // exactly 180 days old falls back to the directory default and stays in
    let two = &rows["2"];
    assert_eq!(two.days_since_purchase, 180);
    assert_eq!(two.category, Category::Distributor);

    // equal dates: the larger id wins, then remission over invoice
    assert_eq!(rows["6"].price_list_id, "4");
    assert_eq!(rows["7"].price_list_id, "2");
    assert_eq!(rows["7"].category, Category::Wholesaler);

    assert_eq!(stores.cursor.get().await.unwrap(), Some(today()));
}

#[tokio::test]
async fn second_run_without_new_sales_is_idempotent() {
    let stores = Stores::in_memory();
    let pipeline = pipeline(sample_bundle(), stores.clone());
    pipeline.run(RunMode::Incremental).await.unwrap();
    let first = report(&stores).await;

    let summary = pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(summary.new_sales, 0);
    assert_eq!(summary.touched_clients, 0);
    assert_eq!(summary.rows_upserted, 0);
    assert_eq!(summary.cursor_before, Some(today()));
    assert_eq!(summary.cursor_after, Some(today()));
    assert_eq!(report(&stores).await, first);
}

#[tokio::test]
async fn replayed_sale_key_is_not_ingested_twice() {
    let stores = Stores::in_memory();
    let first_delivery = FixtureBundle {
        invoices: vec![sale_event("123", "2024-07-01", "1", Some("4"))],
        contacts: contacts(),
        ..Default::default()
    };
    pipeline(first_delivery, stores.clone())
        .run(RunMode::Incremental)
        .await
        .unwrap();

    let replay = FixtureBundle {
        invoices: vec![
            sale_event("123", "2024-07-01", "1", Some("5")),
            sale_event("123", "2024-07-01", "1", Some("2")),
        ],
        contacts: contacts(),
        ..Default::default()
    };
    let summary = pipeline(replay, stores.clone())
        .run(RunMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.fetched_invoices, 2);
    assert_eq!(summary.new_sales, 0);
    let last = stores.sales.last_purchase_per_client(None).await.unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last["1"].price_list_id.as_deref(), Some("4"));
    assert_eq!(report(&stores).await["1"].category, Category::Distributor);
}

#[tokio::test]
async fn incremental_aggregation_requeries_stored_sales() {
    let stores = Stores::in_memory();
    let first = FixtureBundle {
        invoices: vec![sale_event("7", "2024-06-20", "1", Some("4"))],
        contacts: contacts(),
        ..Default::default()
    };
    pipeline_with(engine(), FixturePageSource::new(first), stores.clone(), day(2024, 6, 20))
        .run(RunMode::Incremental)
        .await
        .unwrap();

    // same day, lower id: the batch alone would pick it, the store does not
    let late_arrival = FixtureBundle {
        invoices: vec![sale_event("5", "2024-06-20", "1", Some("2"))],
        contacts: contacts(),
        ..Default::default()
    };
    let summary = pipeline(late_arrival, stores.clone())
        .run(RunMode::Incremental)
        .await
        .unwrap();
    assert_eq!(summary.new_sales, 1);
    assert_eq!(summary.touched_clients, 1);

    let row = &report(&stores).await["1"];
    assert_eq!(row.last_purchase_date, day(2024, 6, 20));
    assert_eq!(row.price_list_id, "4");
    assert_eq!(row.category, Category::Distributor);
    assert_eq!(row.days_since_purchase, 11);
}

fn history() -> Vec<(NaiveDate, Vec<Value>, Vec<Value>)> {
    vec![
        (
            day(2024, 3, 1),
            vec![
                sale_event("1", "2024-01-10", "1", Some("5")),
                sale_event("2", "2024-02-01", "2", None),
                sale_event("50", "2024-03-01", "6", Some("5")),
            ],
            vec![sale_event("3", "2024-02-20", "1", Some("4"))],
        ),
        (
            day(2024, 5, 1),
            vec![
                sale_event("51", "2024-03-01", "6", Some("4")),
                sale_event("4", "2024-04-15", "3", None),
            ],
            vec![sale_event("5", "2024-04-30", "2", Some("5"))],
        ),
        (
            day(2024, 7, 1),
            vec![sale_event("6", "2024-06-30", "1", None)],
            vec![
                sale_event("7", "2024-05-02", "3", Some("4")),
                sale_event("8", "2024-06-01", "7", Some("3")),
            ],
        ),
    ]
}

fn cumulative_bundle(stages: usize) -> FixtureBundle {
    let mut bundle = FixtureBundle {
        contacts: contacts(),
        ..Default::default()
    };
    for (_, invoices, remissions) in history().into_iter().take(stages) {
        bundle.invoices.extend(invoices);
        bundle.remissions.extend(remissions);
    }
    bundle
}

fn projection(rows: &BTreeMap<String, ReportRow>) -> Vec<(String, Category, String, NaiveDate)> {
    rows.values()
        .map(|r| {
            (
                r.client_id.clone(),
                r.category,
                r.price_list_id.clone(),
                r.last_purchase_date,
            )
        })
        .collect()
}

#[tokio::test]
async fn rebuild_matches_chronological_incremental_runs() {
    let incremental = Stores::in_memory();
    for (stage, (run_day, _, _)) in history().into_iter().enumerate() {
        pipeline_with(
            engine(),
            FixturePageSource::new(cumulative_bundle(stage + 1)),
            incremental.clone(),
            run_day,
        )
        .run(RunMode::Incremental)
        .await
        .unwrap();
    }

    let rebuilt = Stores::in_memory();
    let summary = pipeline(cumulative_bundle(3), rebuilt.clone())
        .run(RunMode::Rebuild)
        .await
        .unwrap();
    assert_eq!(summary.new_sales, 10);
    assert_eq!(summary.cursor_after, Some(today()));

    let from_increments = report(&incremental).await;
    let from_rebuild = report(&rebuilt).await;
    assert_eq!(projection(&from_increments), projection(&from_rebuild));
    assert_eq!(from_rebuild["6"].price_list_id, "4");
    assert_eq!(from_rebuild["1"].price_list_id, "5");
}

#[tokio::test]
async fn rebuild_discards_previous_state() {
    let sales = Arc::new(MemorySaleStore::default());
    let stores = Stores::new(
        sales.clone(),
        Arc::new(MemoryReportStore::default()),
        Arc::new(MemorySyncCursor::starting_at(day(2024, 6, 30))),
    );
    sales
        .upsert(&[Sale {
            source_id: "gone".to_string(),
            kind: reorder_core::SaleKind::Invoice,
            client_id: "1".to_string(),
            date: day(2024, 6, 30),
            price_list_id: Some("5".to_string()),
        }])
        .await
        .unwrap();

    let summary = pipeline(sample_bundle(), stores.clone())
        .run(RunMode::Rebuild)
        .await
        .unwrap();
    assert_eq!(summary.cursor_before, Some(day(2024, 6, 30)));
    assert_eq!(sales.len().await, 10);
    assert_eq!(report(&stores).await["1"].last_purchase_date, day(2024, 3, 15));
}

#[tokio::test]
async fn truncated_sale_fetch_keeps_the_cursor() {
    let cursor_date = day(2024, 1, 1);
    let stores = Stores::new(
        Arc::new(MemorySaleStore::default()),
        Arc::new(MemoryReportStore::default()),
        Arc::new(MemorySyncCursor::starting_at(cursor_date)),
    );
    let source = FixturePageSource::new(sample_bundle()).failing_at_page(Endpoint::Remissions, 1);
    let summary = pipeline_with(engine(), source, stores.clone(), today())
        .run(RunMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.truncated_endpoints, vec![Endpoint::Remissions]);
    assert_eq!(summary.fetched_remissions, 2);
    assert_eq!(summary.cursor_after, Some(cursor_date));
    assert_eq!(stores.cursor.get().await.unwrap(), Some(cursor_date));
    assert!(report(&stores).await.contains_key("1"));

    // the retry picks up what the failed page held
    let summary = pipeline(sample_bundle(), stores.clone())
        .run(RunMode::Incremental)
        .await
        .unwrap();
    assert_eq!(summary.new_sales, 1);
    assert_eq!(summary.cursor_after, Some(today()));
    assert_eq!(report(&stores).await["7"].price_list_id, "2");
}

#[tokio::test]
async fn truncation_can_be_allowed_to_advance_the_cursor() {
    let stores = Stores::in_memory();
    let source = FixturePageSource::new(sample_bundle()).failing_at_page(Endpoint::Invoices, 0);
    let summary = pipeline_with(
        EngineConfig {
            advance_cursor_on_truncation: true,
            ..engine()
        },
        source,
        stores.clone(),
        today(),
    )
    .run(RunMode::Incremental)
    .await
    .unwrap();

    assert_eq!(summary.truncated_endpoints, vec![Endpoint::Invoices]);
    assert_eq!(summary.fetched_invoices, 0);
    assert_eq!(summary.cursor_after, Some(today()));
}

#[tokio::test]
async fn truncated_contacts_hold_the_cursor_until_the_directory_is_complete() {
    let stores = Stores::in_memory();
    let source = FixturePageSource::new(sample_bundle()).failing_at_page(Endpoint::Contacts, 1);
    let summary = pipeline_with(engine(), source, stores.clone(), today())
        .run(RunMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.truncated_endpoints, vec![Endpoint::Contacts]);
    assert_eq!(summary.contacts, 2);
    assert_eq!(summary.cursor_after, None);
    assert_eq!(stores.cursor.get().await.unwrap(), None);
    let rows = report(&stores).await;
    assert!(rows.contains_key("1"));
    assert!(!rows.contains_key("6"));

    // every sale is stored already, yet the clients missing last time get rows
    let summary = pipeline(sample_bundle(), stores.clone())
        .run(RunMode::Incremental)
        .await
        .unwrap();
    assert_eq!(summary.new_sales, 0);
    assert_eq!(summary.cursor_after, Some(today()));
    assert_eq!(
        report(&stores).await.keys().cloned().collect::<Vec<_>>(),
        vec!["1", "2", "6", "7"]
    );
}

/// Report store whose first upsert fails.
#[derive(Default)]
struct FlakyReports {
    inner: MemoryReportStore,
    failed_once: AtomicBool,
}

#[async_trait]
impl ReportStore for FlakyReports {
    async fn upsert(&self, rows: &[ReportRow]) -> Result<usize, StoreError> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.upsert(rows).await
    }

    async fn read_all(&self) -> Result<Vec<ReportRow>, StoreError> {
        self.inner.read_all().await
    }

    async fn delete(&self, client_ids: &[String]) -> Result<u64, StoreError> {
        self.inner.delete(client_ids).await
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.inner.delete_all().await
    }
}

#[tokio::test]
async fn retry_after_failed_report_upsert_restores_the_report() {
    let stores = Stores::new(
        Arc::new(MemorySaleStore::default()),
        Arc::new(FlakyReports::default()),
        Arc::new(MemorySyncCursor::default()),
    );
    let pipeline = pipeline(sample_bundle(), stores.clone());
    let err = pipeline.run(RunMode::Incremental).await.unwrap_err();
    assert!(format!("{err:#}").contains("connection reset"));
    assert_eq!(stores.cursor.get().await.unwrap(), None);
    assert!(report(&stores).await.is_empty());

    let summary = pipeline.run(RunMode::Incremental).await.unwrap();
    assert_eq!(summary.new_sales, 0);
    assert_eq!(summary.touched_clients, 7);
    assert_eq!(summary.rows_upserted, 4);
    assert_eq!(summary.cursor_after, Some(today()));

    let rebuilt = Stores::in_memory();
    pipeline_with(engine(), FixturePageSource::new(sample_bundle()), rebuilt.clone(), today())
        .run(RunMode::Rebuild)
        .await
        .unwrap();
    assert_eq!(projection(&report(&stores).await), projection(&report(&rebuilt).await));
}

/// Sale store whose appends always fail.
struct FailingAppend(MemorySaleStore);

#[async_trait]
impl SaleStore for FailingAppend {
    async fn exists(&self, keys: &[SaleKey]) -> Result<HashSet<SaleKey>, StoreError> {
        self.0.exists(keys).await
    }

    async fn upsert(&self, _sales: &[Sale]) -> Result<usize, StoreError> {
        Err(StoreError::Backend("disk full".to_string()))
    }

    async fn last_purchase_per_client(
        &self,
        clients: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, LastPurchase>, StoreError> {
        self.0.last_purchase_per_client(clients).await
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        self.0.delete_all().await
    }
}

#[tokio::test]
async fn failed_append_aborts_before_the_cursor_moves() {
    let cursor_date = day(2024, 1, 1);
    let stores = Stores::new(
        Arc::new(FailingAppend(MemorySaleStore::default())),
        Arc::new(MemoryReportStore::default()),
        Arc::new(MemorySyncCursor::starting_at(cursor_date)),
    );
    let err = pipeline(sample_bundle(), stores.clone())
        .run(RunMode::Incremental)
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("disk full"));
    assert_eq!(stores.cursor.get().await.unwrap(), Some(cursor_date));
    assert!(report(&stores).await.is_empty());
}

/// Cursor that is unreachable for both reads and writes.
struct BrokenCursor;

#[async_trait]
impl SyncCursor for BrokenCursor {
    async fn get(&self) -> Result<Option<NaiveDate>, StoreError> {
        Err(StoreError::Backend("cursor offline".to_string()))
    }

    async fn set(&self, _date: NaiveDate) -> Result<(), StoreError> {
        Err(StoreError::Backend("cursor offline".to_string()))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::Backend("cursor offline".to_string()))
    }
}

#[tokio::test]
async fn unreadable_cursor_falls_back_to_epoch() {
    let stores = Stores::new(
        Arc::new(MemorySaleStore::default()),
        Arc::new(MemoryReportStore::default()),
        Arc::new(BrokenCursor),
    );
    let bundle = FixtureBundle {
        invoices: vec![
            sale_event("1", "2019-12-31", "1", Some("4")),
            sale_event("2", "2020-01-01", "2", Some("4")),
        ],
        contacts: contacts(),
        ..Default::default()
    };
    let summary = pipeline_with(engine(), FixturePageSource::new(bundle), stores, day(2020, 2, 1))
        .run(RunMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.fetched_invoices, 1);
    assert_eq!(summary.new_sales, 1);
    assert_eq!(summary.cursor_before, None);
    assert_eq!(summary.cursor_after, None);
}

#[tokio::test]
async fn rebuild_fails_when_the_cursor_cannot_be_cleared() {
    let stores = Stores::new(
        Arc::new(MemorySaleStore::default()),
        Arc::new(MemoryReportStore::default()),
        Arc::new(BrokenCursor),
    );
    let err = pipeline(sample_bundle(), stores)
        .run(RunMode::Rebuild)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("clearing sync cursor"));
}

#[tokio::test]
async fn stale_rows_are_kept_or_deleted_by_policy() {
    for (policy, expect_kept) in [(StaleRowPolicy::Keep, true), (StaleRowPolicy::Delete, false)] {
        let stores = Stores::in_memory();
        let first = FixtureBundle {
            invoices: vec![
                sale_event("1", "2024-06-01", "1", Some("4")),
                sale_event("2", "2024-06-01", "2", Some("4")),
            ],
            contacts: contacts(),
            ..Default::default()
        };
        pipeline_with(engine(), FixturePageSource::new(first), stores.clone(), day(2024, 6, 1))
            .run(RunMode::Incremental)
            .await
            .unwrap();

        // client 2 moves to an unconfigured price list, client 1 goes quiet
        let later = FixtureBundle {
            invoices: vec![sale_event("3", "2024-12-20", "2", Some("9"))],
            contacts: contacts(),
            ..Default::default()
        };
        let summary = pipeline_with(
            EngineConfig {
                stale_rows: policy,
                ..engine()
            },
            FixturePageSource::new(later),
            stores.clone(),
            day(2025, 1, 1),
        )
        .run(RunMode::Incremental)
        .await
        .unwrap();

        let rows = report(&stores).await;
        assert_eq!(rows.contains_key("1"), expect_kept, "{policy:?}");
        assert_eq!(rows.contains_key("2"), expect_kept, "{policy:?}");
        assert_eq!(summary.rows_deleted, if expect_kept { 0 } else { 2 });
    }
}

#[tokio::test]
async fn test_mode_cap_limits_each_sale_endpoint() {
    let stores = Stores::in_memory();
    let mut config = engine();
    config.sales_pagination.max_items = Some(3);
    let summary = pipeline_with(config, FixturePageSource::new(sample_bundle()), stores, today())
        .run(RunMode::Incremental)
        .await
        .unwrap();

    assert_eq!(summary.fetched_invoices, 3);
    assert_eq!(summary.fetched_remissions, 3);
    assert!(summary.truncated_endpoints.is_empty());
}

#[tokio::test]
async fn reports_are_exported_when_a_directory_is_configured() {
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::in_memory();
    let summary = pipeline_with(
        EngineConfig {
            reports_dir: Some(dir.path().to_path_buf()),
            ..engine()
        },
        FixturePageSource::new(sample_bundle()),
        stores,
        today(),
    )
    .run(RunMode::Incremental)
    .await
    .unwrap();

    let run_dir = dir.path().join(summary.run_id.to_string());
    assert_eq!(summary.reports_dir, Some(run_dir.display().to_string()));
    assert!(run_dir.join("daily_brief.md").exists());
    assert!(run_dir.join("snapshots").join("report.parquet").exists());

    let report: Value =
        serde_json::from_slice(&std::fs::read(run_dir.join("report.json")).unwrap()).unwrap();
    let rows = report["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0]["client_id"], "2");
    assert_eq!(report["summary"]["new_sales"], 10);
}
