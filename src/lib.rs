use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{error, info};

pub mod api;
pub mod bindings;
pub mod cli;
pub mod env;
pub mod error;
pub mod event;
pub mod fetch;
pub mod materialize;
pub mod reconcile;
pub mod scanner;
pub mod store;
pub mod sync;

#[cfg(test)]
pub mod test_utils;

pub use env::{Env, LogLevel};
pub use error::IndexerError;

use crate::env::ChainEnv;
use crate::fetch::BatchFetcher;
use crate::materialize::{Materializer, RebuildSummary};
use crate::reconcile::{AutoFixReport, Reconciler, ValidationReport};
use crate::scanner::LogScanner;
use crate::sync::{SyncCoordinator, SyncReport};

pub async fn connect_provider(chain: &ChainEnv) -> anyhow::Result<impl Provider + Clone> {
    let provider = if chain.rpc_url.scheme().starts_with("ws") {
        let ws = WsConnect::new(chain.rpc_url.as_str());
        ProviderBuilder::new().connect_ws(ws).await?
    } else {
        ProviderBuilder::new().connect_http(chain.rpc_url.clone())
    };
    Ok(provider)
}

fn build_scanner<P: Provider + Clone>(
    provider: P,
    env: &Env,
    cancel: Option<watch::Receiver<bool>>,
) -> LogScanner<P> {
    let mut fetcher = BatchFetcher::new(provider, env.fetcher.clone());
    if let Some(cancel) = cancel {
        fetcher = fetcher.with_cancellation(cancel);
    }
    LogScanner::new(fetcher, env.scanner.clone())
}

/// One sync pass: scan, store, advance the cursor, rebuild the projection.
pub async fn run_sync(
    env: &Env,
    pool: SqlitePool,
    from: Option<u64>,
    to: Option<u64>,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<SyncReport> {
    let provider = connect_provider(&env.chain).await?;
    let scanner = build_scanner(provider, env, Some(cancel.clone()));
    let coordinator = SyncCoordinator::new(pool, scanner, env.chain.clone(), cancel);
    Ok(coordinator.run(from, to).await?)
}

/// Resolves the validation range: explicit bounds win, then the synced
/// cursor, then the chain head.
async fn reconcile_range<P: Provider + Clone>(
    env: &Env,
    pool: &SqlitePool,
    scanner: &LogScanner<P>,
    from: Option<u64>,
    to: Option<u64>,
) -> anyhow::Result<(u64, u64)> {
    let from = from.unwrap_or(env.chain.deployment_block);
    let to = match to {
        Some(to) => to,
        None => {
            let cursor = sync::load_cursor(pool, env.chain.contract).await?;
            match cursor.and_then(|cursor| cursor.last_synced_block) {
                Some(synced) => synced,
                None => scanner.fetcher().chain_head().await?,
            }
        }
    };
    Ok((from, to))
}

pub async fn run_validate(
    env: &Env,
    pool: SqlitePool,
    from: Option<u64>,
    to: Option<u64>,
) -> anyhow::Result<ValidationReport> {
    let provider = connect_provider(&env.chain).await?;
    let scanner = build_scanner(provider, env, None);
    let (from, to) = reconcile_range(env, &pool, &scanner, from, to).await?;
    let reconciler = Reconciler::new(pool, scanner, env.chain.clone());
    Ok(reconciler.validate(from, to).await?)
}

pub async fn run_autofix(
    env: &Env,
    pool: SqlitePool,
    from: Option<u64>,
    to: Option<u64>,
) -> anyhow::Result<AutoFixReport> {
    let provider = connect_provider(&env.chain).await?;
    let scanner = build_scanner(provider, env, None);
    let (from, to) = reconcile_range(env, &pool, &scanner, from, to).await?;
    let reconciler = Reconciler::new(pool, scanner, env.chain.clone());
    Ok(reconciler.auto_fix(from, to).await?)
}

pub async fn run_rebuild(env: &Env, pool: SqlitePool) -> anyhow::Result<RebuildSummary> {
    let materializer = Materializer::new(pool);
    Ok(materializer.rebuild_all(env.chain.contract).await?)
}

/// Serves the query API while a sync pipeline runs in the background.
/// Ctrl-c stops the pipeline at the next window boundary, so the cursor
/// stays at the last fully committed window.
pub async fn launch(env: Env) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let config = rocket::Config::figment()
        .merge(("port", env.api_port))
        .merge(("address", "0.0.0.0"));

    let rocket = rocket::custom(config)
        .mount("/", api::routes())
        .manage(pool.clone());

    let server_task = tokio::spawn(rocket.launch());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pipeline_env = env.clone();
    let pipeline_pool = pool.clone();
    let mut pipeline_task = tokio::spawn(async move {
        match run_sync(&pipeline_env, pipeline_pool, None, None, cancel_rx).await {
            Ok(report) => info!(
                "sync pipeline finished: {} events added, completed={}",
                report.events_added, report.completed
            ),
            Err(error) => error!("sync pipeline failed: {error}"),
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, stopping at the next window boundary");
            let _ = cancel_tx.send(true);
            if let Err(error) = (&mut pipeline_task).await {
                error!("pipeline task panicked: {error}");
            }
        }

        result = &mut pipeline_task => {
            if let Err(error) = result {
                error!("pipeline task panicked: {error}");
            }
        }

        result = server_task => {
            match result {
                Ok(Ok(_)) => info!("server completed"),
                Ok(Err(error)) => error!("server failed: {error}"),
                Err(error) => error!("server task panicked: {error}"),
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}
