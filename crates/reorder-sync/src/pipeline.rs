//! Run orchestration for rebuild and incremental modes.
//!
//! Steps run strictly in sequence. The three stores are written without a
//! shared transaction, so the cursor is always the last thing a run moves: a
//! run that fails earlier is retried from the previous cursor and the dedup
//! layer skips whatever was already appended.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use reorder_adapters::{
    dedupe_sales, load_contact_directory, normalize_events, ContactDirectory, Endpoint, PageSource,
    Paginator,
};
use reorder_core::{sync_epoch, LastPurchase, Sale, SaleKind};
use reorder_storage::Stores;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{last_purchases_for_clients, last_purchases_from_sales, touched_clients};
use crate::classify::{build_report_rows, Classifier, Exclusion};
use crate::config::{EngineConfig, RunMode, StaleRowPolicy};
use crate::export;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub cursor_before: Option<NaiveDate>,
    pub cursor_after: Option<NaiveDate>,
    pub fetched_invoices: usize,
    pub fetched_remissions: usize,
    pub contacts: usize,
    pub rejected_records: usize,
    pub new_sales: usize,
    pub touched_clients: usize,
    pub rows_upserted: usize,
    pub rows_deleted: u64,
    pub truncated_endpoints: Vec<Endpoint>,
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    fn start(mode: RunMode, today: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: now,
            finished_at: now,
            today,
            cursor_before: None,
            cursor_after: None,
            fetched_invoices: 0,
            fetched_remissions: 0,
            contacts: 0,
            rejected_records: 0,
            new_sales: 0,
            touched_clients: 0,
            rows_upserted: 0,
            rows_deleted: 0,
            truncated_endpoints: Vec::new(),
            reports_dir: None,
        }
    }

    /// One-line form printed by the CLI.
    pub fn one_line(&self) -> String {
        format!(
            "run {} ({:?}): {} new sales, {} clients touched, {} rows upserted, {} rows deleted, cursor {} -> {}{}",
            self.run_id,
            self.mode,
            self.new_sales,
            self.touched_clients,
            self.rows_upserted,
            self.rows_deleted,
            self.cursor_before.map_or_else(|| "none".to_string(), |d| d.to_string()),
            self.cursor_after.map_or_else(|| "none".to_string(), |d| d.to_string()),
            if self.truncated_endpoints.is_empty() {
                String::new()
            } else {
                format!(" (truncated: {:?})", self.truncated_endpoints)
            }
        )
    }
}

/// Sales fetched and normalized from both sale endpoints.
struct FetchedSales {
    sales: Vec<Sale>,
}

pub struct SyncPipeline {
    engine: EngineConfig,
    classifier: Classifier,
    source: Arc<dyn PageSource>,
    stores: Stores,
    today: Option<NaiveDate>,
}

impl SyncPipeline {
    pub fn new(
        engine: EngineConfig,
        classifier: Classifier,
        source: Arc<dyn PageSource>,
        stores: Stores,
    ) -> Self {
        Self {
            engine,
            classifier,
            source,
            stores,
            today: None,
        }
    }

    /// Pins "today" instead of reading the local clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    pub async fn run(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::start(mode, self.today());
        let span = info_span!("sync_run", run_id = %summary.run_id, ?mode, today = %summary.today);
        async move {
            info!("sync run started");
            match mode {
                RunMode::Rebuild => self.rebuild(&mut summary).await?,
                RunMode::Incremental => self.incremental(&mut summary).await?,
            }
            self.advance_cursor(&mut summary).await;
            summary.finished_at = Utc::now();
            self.export(&mut summary).await;
            info!(
                new_sales = summary.new_sales,
                touched_clients = summary.touched_clients,
                rows_upserted = summary.rows_upserted,
                rows_deleted = summary.rows_deleted,
                "sync run finished"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn rebuild(&self, summary: &mut SyncRunSummary) -> Result<()> {
        summary.cursor_before = self.read_cursor().await;

        let removed_sales = self
            .stores
            .sales
            .delete_all()
            .await
            .context("clearing sale store for rebuild")?;
        let removed_rows = self
            .stores
            .reports
            .delete_all()
            .await
            .context("clearing report store for rebuild")?;
        self.stores
            .cursor
            .clear()
            .await
            .context("clearing sync cursor for rebuild")?;
        info!(removed_sales, removed_rows, "stores cleared");

        let directory = self.load_directory(summary).await;
        let fetched = self.fetch_sales(None, summary).await;
        let accepted = dedupe_sales(fetched.sales, &Default::default());
        if accepted.duplicates > 0 {
            info!(duplicates = accepted.duplicates, "duplicate sale keys dropped");
        }
        self.append(&accepted.accepted, summary).await?;

        let last = last_purchases_from_sales(&accepted.accepted);
        summary.touched_clients = last.len();
        self.classify_and_upsert(&last, &directory, summary).await?;
        Ok(())
    }

    async fn incremental(&self, summary: &mut SyncRunSummary) -> Result<()> {
        summary.cursor_before = self.read_cursor().await;
        let since = summary.cursor_before.unwrap_or_else(sync_epoch);

        let directory = self.load_directory(summary).await;
        let fetched = self.fetch_sales(Some(since), summary).await;

        let keys: Vec<_> = fetched.sales.iter().map(Sale::key).collect();
        let existing = self
            .stores
            .sales
            .exists(&keys)
            .await
            .context("looking up already ingested sales")?;
        // Already stored sales still count as touched: a run that failed after
        // its append left those clients without report rows.
        let touched = touched_clients(&fetched.sales);
        let deduped = dedupe_sales(fetched.sales, &existing);
        info!(
            accepted = deduped.accepted.len(),
            skipped_existing = deduped.skipped_existing,
            duplicates = deduped.duplicates,
            "sales deduplicated"
        );
        self.append(&deduped.accepted, summary).await?;

        if touched.is_empty() {
            info!("no sales since the cursor; aggregation skipped");
        } else {
            let last = last_purchases_for_clients(self.stores.sales.as_ref(), &touched).await?;
            summary.touched_clients = touched.len();
            let excluded = self.classify_and_upsert(&last, &directory, summary).await?;
            if self.engine.stale_rows == StaleRowPolicy::Delete {
                self.delete_disqualified(&excluded, summary).await;
            }
        }

        if self.engine.stale_rows == StaleRowPolicy::Delete {
            self.sweep_outside_window(summary).await;
        }
        Ok(())
    }

    async fn read_cursor(&self) -> Option<NaiveDate> {
        match self.stores.cursor.get().await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "reading sync cursor failed; falling back to epoch");
                None
            }
        }
    }

    async fn load_directory(&self, summary: &mut SyncRunSummary) -> ContactDirectory {
        let directory =
            load_contact_directory(self.source.as_ref(), self.engine.contacts_pagination.clone())
                .await;
        summary.contacts = directory.len();
        summary.rejected_records += directory.rejected;
        if directory.truncated {
            summary.truncated_endpoints.push(Endpoint::Contacts);
        }
        directory
    }

    async fn fetch_sales(
        &self,
        since: Option<NaiveDate>,
        summary: &mut SyncRunSummary,
    ) -> FetchedSales {
        let mut sales = Vec::new();
        for kind in SaleKind::ALL {
            let endpoint = Endpoint::for_kind(kind);
            let drained = Paginator::new(
                self.source.as_ref(),
                endpoint,
                since,
                self.engine.sales_pagination.clone(),
            )
            .drain()
            .await;
            if drained.truncated {
                warn!(endpoint = endpoint.path(), "sale fetch truncated by a source error");
                summary.truncated_endpoints.push(endpoint);
            }

            let normalized = normalize_events(kind, &drained.items);
            match kind {
                SaleKind::Invoice => summary.fetched_invoices = drained.items.len(),
                SaleKind::Remission => summary.fetched_remissions = drained.items.len(),
            }
            summary.rejected_records += normalized.rejected;
            info!(
                endpoint = endpoint.path(),
                fetched = drained.items.len(),
                normalized = normalized.sales.len(),
                capped = drained.capped,
                "sale endpoint drained"
            );
            sales.extend(normalized.sales);
        }
        FetchedSales { sales }
    }

    async fn append(&self, sales: &[Sale], summary: &mut SyncRunSummary) -> Result<()> {
        if sales.is_empty() {
            return Ok(());
        }
        summary.new_sales = self
            .stores
            .sales
            .upsert(sales)
            .await
            .with_context(|| format!("appending {} sales", sales.len()))?;
        info!(new_sales = summary.new_sales, "sales appended");
        Ok(())
    }

    async fn classify_and_upsert(
        &self,
        last: &BTreeMap<String, LastPurchase>,
        directory: &ContactDirectory,
        summary: &mut SyncRunSummary,
    ) -> Result<Vec<(String, Exclusion)>> {
        let classified = build_report_rows(
            last,
            directory,
            &self.classifier,
            self.engine.window,
            summary.today,
        );
        if !classified.excluded.is_empty() {
            info!(excluded = classified.excluded.len(), "clients left out of the report");
        }
        if !classified.rows.is_empty() {
            summary.rows_upserted = self
                .stores
                .reports
                .upsert(&classified.rows)
                .await
                .with_context(|| format!("upserting {} report rows", classified.rows.len()))?;
        }
        Ok(classified.excluded)
    }

    /// Drops rows of touched clients that lost their category or fell out of
    /// the window. Unknown clients are left alone since the directory may be
    /// incomplete.
    async fn delete_disqualified(
        &self,
        excluded: &[(String, Exclusion)],
        summary: &mut SyncRunSummary,
    ) {
        let ids: Vec<String> = excluded
            .iter()
            .filter(|(_, reason)| *reason != Exclusion::UnknownClient)
            .map(|(id, _)| id.clone())
            .collect();
        if ids.is_empty() {
            return;
        }
        match self.stores.reports.delete(&ids).await {
            Ok(removed) => summary.rows_deleted += removed,
            Err(err) => warn!(error = %err, "deleting disqualified report rows failed"),
        }
    }

    async fn sweep_outside_window(&self, summary: &mut SyncRunSummary) {
        let rows = match self.stores.reports.read_all().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "reading report rows for stale sweep failed");
                return;
            }
        };
        let stale: Vec<String> = rows
            .into_iter()
            .filter(|row| !self.engine.window.contains(row.last_purchase_date, summary.today))
            .map(|row| row.client_id)
            .collect();
        if stale.is_empty() {
            return;
        }
        match self.stores.reports.delete(&stale).await {
            Ok(removed) => {
                info!(removed, "stale report rows swept");
                summary.rows_deleted += removed;
            }
            Err(err) => warn!(error = %err, "stale report sweep failed"),
        }
    }

    async fn advance_cursor(&self, summary: &mut SyncRunSummary) {
        summary.cursor_after = match summary.mode {
            RunMode::Rebuild => None,
            RunMode::Incremental => summary.cursor_before,
        };
        // A partial directory leaves clients out as unknown; holding the
        // cursor lets the retry re-aggregate them once contacts are complete.
        if !summary.truncated_endpoints.is_empty() && !self.engine.advance_cursor_on_truncation {
            warn!(
                truncated = ?summary.truncated_endpoints,
                "fetch was truncated; cursor left in place"
            );
            return;
        }
        match self.stores.cursor.set(summary.today).await {
            Ok(()) => summary.cursor_after = Some(summary.today),
            Err(err) => warn!(error = %err, "writing sync cursor failed"),
        }
    }

    async fn export(&self, summary: &mut SyncRunSummary) {
        let Some(root) = self.engine.reports_dir.clone() else {
            return;
        };
        let rows = match self.stores.reports.read_all().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "reading report rows for export failed");
                return;
            }
        };
        summary.reports_dir = Some(export::run_dir(&root, summary.run_id).display().to_string());
        match export::write_reports(&root, summary, &rows).await {
            Ok(dir) => info!(dir = %dir.display(), "report exported"),
            Err(err) => {
                warn!(error = %err, "report export failed");
                summary.reports_dir = None;
            }
        }
    }
}
