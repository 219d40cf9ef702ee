//! Cron-driven incremental runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{RunMode, SyncConfig};
use crate::pipeline::{SyncPipeline, SyncRunSummary};

/// Runs one incremental sync unless another run holds `gate`.
///
/// Returns `None` when the tick was skipped.
pub async fn run_exclusive(
    pipeline: &SyncPipeline,
    gate: &Mutex<()>,
) -> Option<Result<SyncRunSummary>> {
    let Ok(_guard) = gate.try_lock() else {
        warn!("previous sync run still active; skipping tick");
        return None;
    };
    Some(pipeline.run(RunMode::Incremental).await)
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            match run_exclusive(&pipeline, &gate).await {
                Some(Ok(summary)) => {
                    info!(summary = %summary.one_line(), "scheduled sync finished")
                }
                Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                None => {}
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Builds the cron scheduler only when `SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, &config.sync_cron).await.map(Some)
}
