//! Chunked log scanning over bounded block windows.
//!
//! A scan partitions its range into fixed windows and walks them in
//! ascending order so downstream folds see events in block order. Windows
//! that overflow the provider's response limit are bisected at the midpoint;
//! windows that fail for any other reason are retried with bounded
//! exponential backoff and surfaced as window-scoped failures when retries
//! run out.

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use backon::{ExponentialBuilder, Retryable};
use itertools::Itertools;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bindings::{IERC721, IERC1155};
use crate::env::ScannerConfig;
use crate::error::{FetchError, ScanError};
use crate::event::{self, TransferEvent, expanded_count};
use crate::fetch::BatchFetcher;

/// The result of scanning one window.
#[derive(Debug)]
pub struct WindowScan {
    pub events: Vec<TransferEvent>,
    pub decode_failures: u64,
}

#[derive(Debug)]
pub struct FailedWindow {
    pub from_block: u64,
    pub to_block: u64,
    pub error: ScanError,
}

/// The result of a multi-window scan. Completed windows survive failures in
/// later ones.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub events: Vec<TransferEvent>,
    pub decode_failures: u64,
    pub failed_windows: Vec<FailedWindow>,
}

/// Partitions `[start, end]` into windows of at most `width` blocks.
pub fn block_windows(start: u64, end: u64, width: u64) -> Vec<(u64, u64)> {
    let step = usize::try_from(width.max(1)).unwrap_or(usize::MAX);
    (start..=end)
        .step_by(step)
        .map(|window_start| {
            let window_end = window_start.saturating_add(width.max(1) - 1).min(end);
            (window_start, window_end)
        })
        .collect()
}

pub struct LogScanner<P> {
    fetcher: BatchFetcher<P>,
    config: ScannerConfig,
}

impl<P: Provider + Clone> LogScanner<P> {
    pub fn new(fetcher: BatchFetcher<P>, config: ScannerConfig) -> Self {
        Self { fetcher, config }
    }

    pub const fn fetcher(&self) -> &BatchFetcher<P> {
        &self.fetcher
    }

    pub const fn config(&self) -> &ScannerConfig {
        &self.config
    }

    fn transfer_filter(contract: Address, from: u64, to: u64) -> Filter {
        Filter::new()
            .address(contract)
            .from_block(from)
            .to_block(to)
            .event_signature(vec![
                IERC721::Transfer::SIGNATURE_HASH,
                IERC1155::TransferSingle::SIGNATURE_HASH,
                IERC1155::TransferBatch::SIGNATURE_HASH,
            ])
    }

    /// Raw transfer logs for a range, with retry and oversized-response
    /// bisection. Bisection bottoms out at single-block windows: a block
    /// that still overflows is propagated as unsplittable rather than
    /// retried forever.
    pub async fn fetch_logs(
        &self,
        contract: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ScanError> {
        let strategy = ExponentialBuilder::default()
            .with_max_times(self.config.window_max_retries)
            .with_min_delay(Duration::from_millis(self.config.retry_initial_delay_ms))
            .with_max_delay(Duration::from_secs(self.config.retry_max_delay_secs));

        let attempt =
            || async { self.fetcher.fetch_logs_once(Self::transfer_filter(contract, from, to)).await };

        match attempt
            .retry(&strategy)
            .when(|error: &FetchError| {
                !error.is_oversized() && !matches!(error, FetchError::Cancelled)
            })
            .await
        {
            Ok(logs) => Ok(logs),
            Err(error) if error.is_oversized() => {
                if from >= to {
                    return Err(ScanError::UnsplittableBlock(from));
                }
                let midpoint = from + (to - from) / 2;
                debug!("oversized response for blocks {from}-{to}, bisecting at {midpoint}");
                let mut logs = Box::pin(self.fetch_logs(contract, from, midpoint)).await?;
                let upper = Box::pin(self.fetch_logs(contract, midpoint + 1, to)).await?;
                logs.extend(upper);
                Ok(logs)
            }
            Err(source) => Err(ScanError::WindowFailed {
                from,
                to,
                attempts: self.config.window_max_retries + 1,
                source,
            }),
        }
    }

    /// Scans one window into normalized events. Timestamps for the distinct
    /// blocks in the window are resolved through the fetcher's batching;
    /// undecodable logs are skipped and counted, never fatal for the window.
    pub async fn scan_window(
        &self,
        contract: Address,
        from: u64,
        to: u64,
    ) -> Result<WindowScan, ScanError> {
        let logs = self.fetch_logs(contract, from, to).await?;

        let blocks: Vec<u64> = logs.iter().filter_map(|log| log.block_number).collect();
        let timestamps =
            self.fetcher
                .fetch_timestamps(&blocks)
                .await
                .map_err(|source| ScanError::WindowFailed {
                    from,
                    to,
                    attempts: 1,
                    source,
                })?;

        let mut events = Vec::new();
        let mut decode_failures = 0u64;
        for log in &logs {
            let timestamp = log
                .block_number
                .and_then(|number| timestamps.get(&number))
                .map_or(0, |block| i64::try_from(block.timestamp).unwrap_or(i64::MAX));

            match event::normalize(log, timestamp) {
                Ok(mut normalized) => events.append(&mut normalized),
                Err(error) => {
                    decode_failures += 1;
                    warn!(
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        block = ?log.block_number,
                        "skipping undecodable log: {error}"
                    );
                }
            }
        }

        let events = events
            .into_iter()
            .sorted_by_key(TransferEvent::ordering_key)
            .collect();

        Ok(WindowScan {
            events,
            decode_failures,
        })
    }

    /// Scans a full range window-by-window in ascending order. A window that
    /// exhausts its retries is recorded as failed without discarding the
    /// windows already completed.
    pub async fn scan(&self, contract: Address, from: u64, to: u64) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        for (window_from, window_to) in block_windows(from, to, self.config.window_blocks) {
            match self.scan_window(contract, window_from, window_to).await {
                Ok(mut scan) => {
                    outcome.events.append(&mut scan.events);
                    outcome.decode_failures += scan.decode_failures;
                }
                Err(error) => {
                    warn!("window {window_from}-{window_to} failed: {error}");
                    outcome.failed_windows.push(FailedWindow {
                        from_block: window_from,
                        to_block: window_to,
                        error,
                    });
                }
            }
        }
        outcome
    }

    /// Authoritative expanded-record count for a range, queried directly
    /// from the source. Used by reconciliation.
    pub async fn count_events(
        &self,
        contract: Address,
        from: u64,
        to: u64,
    ) -> Result<u64, ScanError> {
        let logs = self.fetch_logs(contract, from, to).await?;
        Ok(expanded_count(&logs))
    }
}
