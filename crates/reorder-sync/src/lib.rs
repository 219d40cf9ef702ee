//! Client reorder sync engine: aggregation, classification and run
//! orchestration over the remote sale source and the persisted stores.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod export;
pub mod pipeline;
pub mod schedule;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reorder_adapters::{load_fixture_bundle, FixturePageSource, PageSource, RemoteApiSource};
use reorder_storage::{postgres, BasicAuth, HttpClientConfig, HttpFetcher, Stores};
use tracing::info;

pub use classify::{Classifier, RecencyWindow};
pub use config::{EngineConfig, PriceListConfig, RunMode, StaleRowPolicy, StoreBackend, SyncConfig};
pub use export::report_daily_markdown;
pub use pipeline::{SyncPipeline, SyncRunSummary};
pub use schedule::{build_scheduler, maybe_build_scheduler};

fn page_source(config: &SyncConfig) -> Result<Arc<dyn PageSource>> {
    if let Some(path) = &config.fixtures_path {
        info!(path = %path.display(), "reading remote source from fixture bundle");
        let bundle = load_fixture_bundle(path)?;
        return Ok(Arc::new(FixturePageSource::new(bundle)));
    }

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let auth = config.api_email.as_ref().map(|email| BasicAuth {
        username: email.clone(),
        password: config.api_token.clone(),
    });
    Ok(Arc::new(RemoteApiSource::new(http, config.api_base.clone(), auth)?))
}

async fn stores(config: &SyncConfig) -> Result<Stores> {
    match config.store_backend {
        StoreBackend::Memory => Ok(Stores::in_memory()),
        StoreBackend::Postgres => {
            let pool = postgres::connect(&config.database_url)
                .await
                .context("connecting to the database")?;
            Ok(Stores::postgres(pool, config.write_chunk_size.max(1)))
        }
    }
}

/// Wires source, stores and classifier from `config`.
pub async fn build_pipeline(config: &SyncConfig) -> Result<SyncPipeline> {
    let classifier = PriceListConfig::load(&config.price_lists_path)?.classifier()?;
    let source = page_source(config)?;
    let stores = stores(config).await?;
    Ok(SyncPipeline::new(config.engine(), classifier, source, stores))
}

pub async fn run_sync_once_from_env(force_rebuild: bool) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let mode = if force_rebuild { RunMode::Rebuild } else { config.mode };
    build_pipeline(&config).await?.run(mode).await
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let pool = postgres::connect(&config.database_url)
        .await
        .context("connecting to the database")?;
    postgres::migrate(&pool).await.context("applying migrations")?;
    Ok(())
}
