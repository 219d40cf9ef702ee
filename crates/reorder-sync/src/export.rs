//! Report files written after a run, and the index over past runs.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Date32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use reorder_core::{Category, ReportRow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::pipeline::SyncRunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn run_dir(root: &Path, run_id: Uuid) -> PathBuf {
    root.join(run_id.to_string())
}

/// Most overdue first, then by client id.
pub fn rows_by_overdue(rows: &[ReportRow]) -> Vec<&ReportRow> {
    let mut sorted: Vec<&ReportRow> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        b.days_since_purchase
            .cmp(&a.days_since_purchase)
            .then_with(|| a.client_id.cmp(&b.client_id))
    });
    sorted
}

fn daily_brief(summary: &SyncRunSummary, rows: &[ReportRow]) -> String {
    let mut per_category: BTreeMap<Category, usize> = BTreeMap::new();
    for row in rows {
        *per_category.entry(row.category).or_default() += 1;
    }
    let categories = if per_category.is_empty() {
        "- none".to_string()
    } else {
        per_category
            .iter()
            .map(|(category, count)| format!("- {category}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Client Reorder Brief\n\n- Run ID: `{}`\n- Mode: {:?}\n- Today: {}\n- Started: {}\n- Finished: {}\n- New sales: {}\n- Clients touched: {}\n- Report rows: {}\n\n## Clients per category\n{}\n",
        summary.run_id,
        summary.mode,
        summary.today,
        summary.started_at,
        summary.finished_at,
        summary.new_sales,
        summary.touched_clients,
        rows.len(),
        categories
    )
}

/// Writes `daily_brief.md`, `report.json` and the parquet snapshot with its
/// manifest under `<root>/<run_id>/`.
pub async fn write_reports(
    root: &Path,
    summary: &SyncRunSummary,
    rows: &[ReportRow],
) -> Result<PathBuf> {
    let dir = run_dir(root, summary.run_id);
    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let brief_path = dir.join("daily_brief.md");
    fs::write(&brief_path, daily_brief(summary, rows))
        .await
        .context("writing daily_brief.md")?;

    let report_path = dir.join("report.json");
    let report = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "rows": rows_by_overdue(rows),
    }))
    .context("serializing report")?;
    fs::write(&report_path, report)
        .await
        .context("writing report.json")?;

    let parquet_path = snapshot_dir.join("report.parquet");
    write_report_parquet(&parquet_path, rows)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("report", &dir, &parquet_path)?,
            manifest_entry("report_json", &dir, &report_path)?,
            manifest_entry("daily_brief", &dir, &brief_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(dir)
}

fn days_since_unix_epoch(date: NaiveDate) -> i32 {
    date.signed_duration_since(NaiveDate::default()).num_days() as i32
}

fn write_report_parquet(path: &Path, rows: &[ReportRow]) -> Result<()> {
    let rows = rows_by_overdue(rows);
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("client_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("email", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("price_list_id", DataType::Utf8, false),
        ArrowField::new("last_purchase_date", DataType::Date32, false),
        ArrowField::new("days_since_purchase", DataType::Int64, false),
    ]));

    let text = |f: fn(&ReportRow) -> &str| {
        StringArray::from(rows.iter().map(|r| f(r)).collect::<Vec<_>>())
    };
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text(|r| r.client_id.as_str())),
            Arc::new(text(|r| r.name.as_str())),
            Arc::new(text(|r| r.email.as_str())),
            Arc::new(text(|r| r.city.as_str())),
            Arc::new(text(|r| r.state.as_str())),
            Arc::new(text(|r| r.category.label())),
            Arc::new(text(|r| r.price_list_id.as_str())),
            Arc::new(Date32Array::from(
                rows.iter()
                    .map(|r| days_since_unix_epoch(r.last_purchase_date))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.days_since_purchase).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building report record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Markdown index of the `runs` most recently exported runs under `root`.
pub fn report_daily_markdown(runs: usize, root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("report.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Client Reorder Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join("report.json");
        let report: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        let summary = &report["summary"];
        let rows = report["rows"].as_array().map(Vec::len).unwrap_or(0);
        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- mode: {}",
            summary["mode"].as_str().unwrap_or("unknown")
        ));
        lines.push(format!(
            "- today: {}",
            summary["today"].as_str().unwrap_or("unknown")
        ));
        lines.push(format!("- new sales: {}", summary["new_sales"]));
        lines.push(format!("- report rows: {rows}"));
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
