//! End-to-end sync orchestration and resumable progress.
//!
//! One coordinator drives one contract's pipeline: scan a window, store its
//! events atomically, advance the persisted cursor, repeat. The cursor only
//! ever reflects fully committed windows, so a crash or cancellation loses
//! at most the window that was in flight.

use alloy::primitives::Address;
use alloy::providers::Provider;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::env::ChainEnv;
use crate::error::{IndexerError, PersistenceError};
use crate::event::canonical_address;
use crate::materialize::Materializer;
use crate::scanner::{LogScanner, block_windows};
use crate::store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// Singleton progress row per contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCursor {
    pub contract: String,
    pub last_synced_block: Option<u64>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub last_reconciliation: Option<serde_json::Value>,
}

pub async fn load_cursor(
    pool: &SqlitePool,
    contract: Address,
) -> Result<Option<SyncCursor>, PersistenceError> {
    let row: Option<(String, Option<i64>, String, Option<String>, Option<String>)> =
        sqlx::query_as(
            "SELECT contract, last_synced_block, status, error, last_reconciliation \
             FROM sync_cursors WHERE contract = ?1",
        )
        .bind(canonical_address(&contract))
        .fetch_optional(pool)
        .await?;

    let Some((contract, last_synced_block, status, error, last_reconciliation)) = row else {
        return Ok(None);
    };

    Ok(Some(SyncCursor {
        contract,
        last_synced_block: last_synced_block
            .map(|block| {
                u64::try_from(block).map_err(|_| {
                    PersistenceError::Corrupt(format!("cursor block negative: {block}"))
                })
            })
            .transpose()?,
        status: RunStatus::from_str(&status).map_err(PersistenceError::Corrupt)?,
        error,
        last_reconciliation: last_reconciliation
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok()),
    }))
}

/// Advances the cursor to the end of a durably stored window.
pub async fn advance_cursor(
    pool: &SqlitePool,
    contract: Address,
    block: u64,
) -> Result<(), PersistenceError> {
    let block = i64::try_from(block)
        .map_err(|_| PersistenceError::Corrupt(format!("cursor block out of range: {block}")))?;

    sqlx::query(
        "INSERT INTO sync_cursors (contract, last_synced_block, status, error) \
         VALUES (?1, ?2, 'running', NULL) \
         ON CONFLICT (contract) DO UPDATE \
         SET last_synced_block = ?2, status = 'running', error = NULL, \
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(canonical_address(&contract))
    .bind(block)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_status(
    pool: &SqlitePool,
    contract: Address,
    status: RunStatus,
    error: Option<&str>,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO sync_cursors (contract, status, error) VALUES (?1, ?2, ?3) \
         ON CONFLICT (contract) DO UPDATE \
         SET status = ?2, error = ?3, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(canonical_address(&contract))
    .bind(status.as_str())
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Stores the latest reconciliation summary on the cursor row for the
/// status surface. The per-window findings stay ephemeral.
pub async fn record_reconciliation(
    pool: &SqlitePool,
    contract: Address,
    summary: &serde_json::Value,
) -> Result<(), PersistenceError> {
    let raw = summary.to_string();
    sqlx::query(
        "INSERT INTO sync_cursors (contract, status, last_reconciliation) \
         VALUES (?1, 'idle', ?2) \
         ON CONFLICT (contract) DO UPDATE \
         SET last_reconciliation = ?2, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(canonical_address(&contract))
    .bind(&raw)
    .execute(pool)
    .await?;

    Ok(())
}

/// Structured outcome of one sync run. Partial success is explicit: failed
/// windows are listed and `completed` stays false.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub contract: String,
    pub from_block: u64,
    pub to_block: u64,
    pub windows_scanned: usize,
    pub events_added: u64,
    pub decode_failures: u64,
    pub failed_windows: Vec<FailedWindowReport>,
    pub positions: usize,
    pub anomalies: usize,
    pub cancelled: bool,
    pub completed: bool,
}

#[derive(Debug, Serialize)]
pub struct FailedWindowReport {
    pub from_block: u64,
    pub to_block: u64,
    pub error: String,
}

pub struct SyncCoordinator<P> {
    pool: SqlitePool,
    store: EventStore,
    materializer: Materializer,
    scanner: LogScanner<P>,
    chain: ChainEnv,
    cancel: watch::Receiver<bool>,
}

impl<P: Provider + Clone> SyncCoordinator<P> {
    pub fn new(
        pool: SqlitePool,
        scanner: LogScanner<P>,
        chain: ChainEnv,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let store = EventStore::new(pool.clone());
        let materializer = Materializer::new(pool.clone());
        Self {
            pool,
            store,
            materializer,
            scanner,
            chain,
            cancel,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Runs one sync pass. The effective start is the later of the explicit
    /// start, the persisted cursor and the deployment block; the effective
    /// end is the explicit end or the chain head at invocation time.
    pub async fn run(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<SyncReport, IndexerError> {
        let contract = self.chain.contract;

        let cursor = load_cursor(&self.pool, contract).await?;
        let resume_from = cursor
            .as_ref()
            .and_then(|cursor| cursor.last_synced_block)
            .map(|block| block + 1);

        let mut start = self.chain.deployment_block;
        if let Some(explicit) = from {
            start = start.max(explicit);
        }
        if let Some(resume) = resume_from {
            start = start.max(resume);
        }

        let end = match to {
            Some(end) => end,
            None => self.scanner.fetcher().chain_head().await?,
        };

        let mut report = SyncReport {
            contract: canonical_address(&contract),
            from_block: start,
            to_block: end,
            windows_scanned: 0,
            events_added: 0,
            decode_failures: 0,
            failed_windows: Vec::new(),
            positions: 0,
            anomalies: 0,
            cancelled: false,
            completed: false,
        };

        if start > end {
            info!("nothing to sync: start {start} is past end {end}");
            set_status(&self.pool, contract, RunStatus::Completed, None).await?;
            report.completed = true;
            return Ok(report);
        }

        info!(
            contract = %contract,
            "starting sync of blocks {start}-{end} ({} blocks)",
            end - start + 1
        );
        set_status(&self.pool, contract, RunStatus::Running, None).await?;

        let mut cursor_frozen = false;

        for (window_from, window_to) in
            block_windows(start, end, self.scanner.config().window_blocks)
        {
            if self.is_cancelled() {
                warn!("sync cancelled, cursor reflects last committed window");
                set_status(&self.pool, contract, RunStatus::Idle, None).await?;
                report.cancelled = true;
                return Ok(report);
            }

            match self.scanner.scan_window(contract, window_from, window_to).await {
                Ok(scan) => {
                    // Storage failures abort the run; committed windows stay.
                    let inserted = match self.store.append(&scan.events).await {
                        Ok(inserted) => inserted,
                        Err(error) => {
                            set_status(
                                &self.pool,
                                contract,
                                RunStatus::Failed,
                                Some(&error.to_string()),
                            )
                            .await?;
                            return Err(error.into());
                        }
                    };

                    report.windows_scanned += 1;
                    report.events_added += inserted;
                    report.decode_failures += scan.decode_failures;

                    if !cursor_frozen {
                        advance_cursor(&self.pool, contract, window_to).await?;
                    }
                }
                Err(error) => {
                    warn!("window {window_from}-{window_to} failed: {error}");
                    report.failed_windows.push(FailedWindowReport {
                        from_block: window_from,
                        to_block: window_to,
                        error: error.to_string(),
                    });
                    // Later windows still run (appends are idempotent), but
                    // the cursor must stay contiguous.
                    cursor_frozen = true;
                }
            }
        }

        let rebuild = self.materializer.rebuild_all(contract).await?;
        report.positions = rebuild.positions;
        report.anomalies = rebuild.anomalies.len();

        if report.failed_windows.is_empty() {
            set_status(&self.pool, contract, RunStatus::Completed, None).await?;
            report.completed = true;
            info!(
                "sync completed: {} events added across {} windows",
                report.events_added, report.windows_scanned
            );
        } else {
            let detail = report
                .failed_windows
                .iter()
                .map(|failed| {
                    format!(
                        "{}-{}: {}",
                        failed.from_block, failed.to_block, failed.error
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            set_status(&self.pool, contract, RunStatus::Failed, Some(&detail)).await?;
            warn!(
                "sync partially failed: {} of {} windows could not be scanned",
                report.failed_windows.len(),
                report.windows_scanned + report.failed_windows.len()
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::tests::{create_test_fetcher_config, create_test_scanner_config};
    use crate::fetch::BatchFetcher;
    use crate::test_utils::{mock_block, setup_test_db, test_contract, transfer_log};
    use alloy::primitives::U256;
    use alloy::providers::{ProviderBuilder, mock::Asserter};

    fn coordinator_for(
        pool: SqlitePool,
        asserter: Asserter,
    ) -> (SyncCoordinator<impl Provider + Clone>, watch::Sender<bool>) {
        let provider = ProviderBuilder::new().connect_mocked_client(asserter);
        let fetcher = BatchFetcher::new(provider, create_test_fetcher_config());
        let scanner = LogScanner::new(fetcher, create_test_scanner_config());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let chain = ChainEnv {
            rpc_url: url::Url::parse("ws://localhost:8545").unwrap(),
            contract: test_contract(),
            deployment_block: 1,
        };
        (
            SyncCoordinator::new(pool, scanner, chain, cancel_rx),
            cancel_tx,
        )
    }

    #[tokio::test]
    async fn run_scans_stores_and_materializes() {
        let pool = setup_test_db().await;
        let asserter = Asserter::new();
        // One window: mint at 100, transfer at 101, burn at 102.
        asserter.push_success(&serde_json::json!([
            transfer_log(100, 0, true, false, 10),
            transfer_log(101, 0, false, false, 4),
            transfer_log(102, 0, false, true, 2),
        ]));
        asserter.push_success(&mock_block(100, 1_000));
        asserter.push_success(&mock_block(101, 2_000));
        asserter.push_success(&mock_block(102, 3_000));

        let (coordinator, _cancel) = coordinator_for(pool.clone(), asserter);
        let report = coordinator.run(Some(100), Some(102)).await.unwrap();

        assert!(report.completed);
        assert_eq!(report.events_added, 3);
        assert_eq!(report.windows_scanned, 1);
        assert_eq!(report.positions, 2);

        let cursor = load_cursor(&pool, test_contract()).await.unwrap().unwrap();
        assert_eq!(cursor.last_synced_block, Some(102));
        assert_eq!(cursor.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn rerun_is_idempotent() {
        let pool = setup_test_db().await;

        for _ in 0..2 {
            let asserter = Asserter::new();
            asserter.push_success(&serde_json::json!([transfer_log(100, 0, true, false, 10)]));
            asserter.push_success(&mock_block(100, 1_000));

            let (coordinator, _cancel) = coordinator_for(pool.clone(), asserter);
            // Explicit range overlapping what the cursor already covers.
            coordinator.run(Some(100), Some(100)).await.unwrap();

            // Reset the cursor so the second pass re-scans the same range.
            sqlx::query("DELETE FROM sync_cursors")
                .execute(&pool)
                .await
                .unwrap();
        }

        let store = EventStore::new(pool);
        assert_eq!(
            store.count_in_range(test_contract(), 0, 1000).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn resume_skips_already_synced_blocks() {
        let pool = setup_test_db().await;
        advance_cursor(&pool, test_contract(), 500).await.unwrap();

        let asserter = Asserter::new();
        let (coordinator, _cancel) = coordinator_for(pool.clone(), asserter);
        let report = coordinator.run(None, Some(400)).await.unwrap();

        assert!(report.completed);
        assert_eq!(report.windows_scanned, 0);
        assert_eq!(report.from_block, 501);
    }

    #[tokio::test]
    async fn failed_window_freezes_cursor_but_run_continues() {
        let pool = setup_test_db().await;
        let asserter = Asserter::new();
        // Window 1 (1-2000): clean and empty.
        asserter.push_success(&serde_json::json!([]));
        // Window 2 (2001-4000): persistent transient failure.
        for _ in 0..16 {
            asserter.push_failure_msg("connection reset");
        }
        // Window 3 (4001-5000): clean with one event.
        asserter.push_success(&serde_json::json!([transfer_log(4500, 0, true, false, 1)]));
        asserter.push_success(&mock_block(4500, 1_000));

        let (coordinator, _cancel) = coordinator_for(pool.clone(), asserter);
        let report = coordinator.run(Some(1), Some(5000)).await.unwrap();

        assert!(!report.completed);
        assert_eq!(report.failed_windows.len(), 1);
        assert_eq!(report.failed_windows[0].from_block, 2001);
        assert_eq!(report.events_added, 1);

        let cursor = load_cursor(&pool, test_contract()).await.unwrap().unwrap();
        assert_eq!(cursor.last_synced_block, Some(2000));
        assert_eq!(cursor.status, RunStatus::Failed);
        assert!(cursor.error.is_some());
    }

    #[tokio::test]
    async fn cancellation_stops_between_windows() {
        let pool = setup_test_db().await;
        let asserter = Asserter::new();

        let (coordinator, cancel) = coordinator_for(pool.clone(), asserter);
        cancel.send(true).unwrap();

        let report = coordinator.run(Some(1), Some(5000)).await.unwrap();

        assert!(report.cancelled);
        assert!(!report.completed);
        assert_eq!(report.windows_scanned, 0);

        let cursor = load_cursor(&pool, test_contract()).await.unwrap().unwrap();
        assert_eq!(cursor.status, RunStatus::Idle);
        assert_eq!(cursor.last_synced_block, None);
    }

    #[tokio::test]
    async fn reconciliation_summary_roundtrips_on_cursor() {
        let pool = setup_test_db().await;
        let summary = serde_json::json!({"discrepant": 0, "accuracy_pct": 100.0});

        record_reconciliation(&pool, test_contract(), &summary)
            .await
            .unwrap();

        let cursor = load_cursor(&pool, test_contract()).await.unwrap().unwrap();
        assert_eq!(cursor.last_reconciliation, Some(summary));
    }

    #[tokio::test]
    async fn quantities_survive_the_full_path() {
        let pool = setup_test_db().await;
        let asserter = Asserter::new();
        asserter.push_success(&serde_json::json!([transfer_log(100, 0, true, false, 7)]));
        asserter.push_success(&mock_block(100, 1_000));

        let (coordinator, _cancel) = coordinator_for(pool.clone(), asserter);
        coordinator.run(Some(100), Some(100)).await.unwrap();

        let store = EventStore::new(pool);
        let events = store.all_events(test_contract()).await.unwrap();
        assert_eq!(events[0].quantity, U256::from(7));
        assert_eq!(events[0].block_timestamp, 1_000);
    }
}
