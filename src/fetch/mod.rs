//! Rate-adaptive batched reads against the upstream RPC source.
//!
//! Every upstream round-trip in the pipeline goes through [`BatchFetcher`]:
//! block-timestamp lookups, log queries and the chain-head probe. Requests
//! inside a batch run concurrently; batches themselves are strictly
//! sequential so the pacing state observed after one batch governs the next.

pub mod policy;

use std::collections::HashMap;
use std::time::Duration;

use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use futures_util::future;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::env::FetcherConfig;
use crate::error::FetchError;
use crate::fetch::policy::RatePolicy;

/// Rounds a rate-limited request is requeued before giving up on it.
const RATE_LIMIT_MAX_ROUNDS: u32 = 8;

#[derive(Debug, Clone)]
pub enum RpcRequest {
    BlockByNumber(u64),
    Logs(Filter),
}

#[derive(Debug, Clone)]
pub enum RpcResponse {
    Block(FetchedBlock),
    Logs(Vec<Log>),
}

#[derive(Debug, Clone, Copy)]
pub struct FetchedBlock {
    pub number: u64,
    pub timestamp: u64,
    /// True when the upstream lookup failed and the timestamp was synthesized
    /// from wall clock. Callers must treat these as lower-confidence.
    pub synthesized: bool,
}

pub struct BatchFetcher<P> {
    provider: P,
    config: FetcherConfig,
    timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl<P: Provider + Clone> BatchFetcher<P> {
    pub fn new(provider: P, config: FetcherConfig) -> Self {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        Self {
            provider,
            config,
            timeout,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub async fn chain_head(&self) -> Result<u64, FetchError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|error| FetchError::classify(&error))
    }

    /// Resolves every request, returning per-request results in request
    /// order. Rate-limited requests are requeued onto later, slower batches;
    /// other failures are retried once individually. Cancellation is only
    /// observed between batches, never mid-batch.
    pub async fn fetch_batch(
        &self,
        requests: &[RpcRequest],
    ) -> Vec<Result<RpcResponse, FetchError>> {
        let total = requests.len();
        let mut policy = RatePolicy::seeded_for(total, &self.config);
        let mut slots: Vec<Option<Result<RpcResponse, FetchError>>> =
            (0..total).map(|_| None).collect();
        let mut pending: Vec<usize> = (0..total).collect();
        let mut rate_limited_rounds = 0u32;
        let mut first_round = true;

        while !pending.is_empty() {
            if self.is_cancelled() {
                for index in pending.drain(..) {
                    slots[index] = Some(Err(FetchError::Cancelled));
                }
                break;
            }

            if !first_round {
                self.pause(policy.delay()).await;
            }
            first_round = false;

            let take = policy.batch_size().min(pending.len());
            let round: Vec<usize> = pending.drain(..take).collect();
            let results =
                future::join_all(round.iter().map(|&index| self.dispatch(&requests[index]))).await;

            let mut rate_limited = Vec::new();
            let mut round_had_rate_limit = false;
            let mut round_had_error = false;

            for (&index, result) in round.iter().zip(results) {
                match result {
                    Ok(response) => slots[index] = Some(Ok(response)),
                    Err(error) if error.is_rate_limited() => {
                        round_had_rate_limit = true;
                        round_had_error = true;
                        rate_limited.push(index);
                    }
                    Err(error) if error.is_oversized() => {
                        round_had_error = true;
                        slots[index] = Some(Err(error));
                    }
                    Err(error) => {
                        round_had_error = true;
                        slots[index] = Some(self.retry_individually(&requests[index], &error).await);
                    }
                }
            }

            if round_had_rate_limit {
                rate_limited_rounds += 1;
                if policy.record_rate_limited_batch() {
                    warn!(
                        delay_ms = u64::try_from(policy.delay().as_millis()).unwrap_or(u64::MAX),
                        batch_size = policy.batch_size(),
                        "emergency throttling engaged after consecutive rate limits"
                    );
                }
                if rate_limited_rounds >= RATE_LIMIT_MAX_ROUNDS {
                    for index in rate_limited {
                        slots[index] = Some(Err(FetchError::RateLimited(
                            "rate limit retries exhausted".to_string(),
                        )));
                    }
                } else {
                    pending.extend(rate_limited);
                }
            } else if !round_had_error {
                policy.record_clean_batch();
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(FetchError::Transient("request was never resolved".to_string()))
                })
            })
            .collect()
    }

    /// Timestamps for a set of blocks, deduplicated, keyed by block number.
    pub async fn fetch_timestamps(
        &self,
        blocks: &[u64],
    ) -> Result<HashMap<u64, FetchedBlock>, FetchError> {
        let mut unique: Vec<u64> = blocks.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let requests: Vec<RpcRequest> = unique
            .iter()
            .map(|&number| RpcRequest::BlockByNumber(number))
            .collect();

        let mut timestamps = HashMap::with_capacity(unique.len());
        for result in self.fetch_batch(&requests).await {
            match result {
                Ok(RpcResponse::Block(block)) => {
                    timestamps.insert(block.number, block);
                }
                Ok(RpcResponse::Logs(_)) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(timestamps)
    }

    /// A single log query through the batch path, so it participates in the
    /// same pacing and classification.
    pub async fn fetch_logs_once(&self, filter: Filter) -> Result<Vec<Log>, FetchError> {
        let mut results = self.fetch_batch(&[RpcRequest::Logs(filter)]).await;
        match results.pop() {
            Some(Ok(RpcResponse::Logs(logs))) => Ok(logs),
            Some(Ok(RpcResponse::Block(_))) | None => Err(FetchError::Transient(
                "unexpected batch result for log query".to_string(),
            )),
            Some(Err(error)) => Err(error),
        }
    }

    async fn retry_individually(
        &self,
        request: &RpcRequest,
        original: &FetchError,
    ) -> Result<RpcResponse, FetchError> {
        debug!("retrying failed request once individually: {original}");
        match self.dispatch(request).await {
            Ok(response) => Ok(response),
            Err(retry_error) => match request {
                RpcRequest::BlockByNumber(number) => {
                    warn!(
                        block = number,
                        "block lookup failed twice, synthesizing timestamp: {retry_error}"
                    );
                    Ok(RpcResponse::Block(FetchedBlock {
                        number: *number,
                        timestamp: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0),
                        synthesized: true,
                    }))
                }
                RpcRequest::Logs(_) => Err(retry_error),
            },
        }
    }

    async fn dispatch(&self, request: &RpcRequest) -> Result<RpcResponse, FetchError> {
        let call = async {
            match request {
                RpcRequest::BlockByNumber(number) => {
                    let block = self
                        .provider
                        .get_block_by_number((*number).into())
                        .await
                        .map_err(|error| FetchError::classify(&error))?;
                    let block = block.ok_or_else(|| {
                        FetchError::Transient(format!("block {number} not found"))
                    })?;
                    Ok(RpcResponse::Block(FetchedBlock {
                        number: *number,
                        timestamp: block.header.inner.timestamp,
                        synthesized: false,
                    }))
                }
                RpcRequest::Logs(filter) => {
                    let logs = self
                        .provider
                        .get_logs(filter)
                        .await
                        .map_err(|error| FetchError::classify(&error))?;
                    Ok(RpcResponse::Logs(logs))
                }
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }

    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let jitter_ceiling = delay_ms / 10;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        tokio::time::sleep(Duration::from_millis(delay_ms.saturating_add(jitter))).await;
    }
}
