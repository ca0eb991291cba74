//! Adaptive pacing state for batched upstream reads.
//!
//! One `RatePolicy` value is seeded per `fetch_batch` call from the request
//! volume, then mutated as the call's internal batches succeed or hit rate
//! limits. Keeping the state machine free of I/O makes it testable without a
//! provider.

use std::time::Duration;

use crate::env::FetcherConfig;

/// Two consecutive rate-limited batches trigger emergency throttling: the
/// delay at least doubles (capped) and the batch size halves (floored).
#[derive(Debug, Clone)]
pub struct RatePolicy {
    batch_size: usize,
    delay: Duration,
    consecutive_rate_limits: u32,
    min_delay_ms: u64,
    max_delay_ms: u64,
    min_batch: usize,
    max_batch: usize,
    escalation_threshold: u32,
}

impl RatePolicy {
    /// Seeds the starting tier from the number of requests the caller wants
    /// resolved: large calls start conservative, small calls aggressive.
    pub fn seeded_for(total_requests: usize, config: &FetcherConfig) -> Self {
        let (batch_size, delay_ms) = if total_requests >= 100 {
            (config.conservative_batch, config.conservative_delay_ms)
        } else if total_requests >= 50 {
            (config.medium_batch, config.medium_delay_ms)
        } else {
            (config.aggressive_batch, config.aggressive_delay_ms)
        };

        Self {
            batch_size: batch_size.max(1),
            delay: Duration::from_millis(delay_ms),
            consecutive_rate_limits: 0,
            min_delay_ms: config.min_delay_ms,
            max_delay_ms: config.max_delay_ms,
            min_batch: config.min_batch.max(1),
            max_batch: config.max_batch.max(1),
            escalation_threshold: config.escalation_threshold.max(1),
        }
    }

    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub const fn delay(&self) -> Duration {
        self.delay
    }

    pub const fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits
    }

    /// A batch completed with zero errors: decay the delay multiplicatively
    /// toward the floor and let the batch size grow toward the ceiling.
    pub fn record_clean_batch(&mut self) {
        self.consecutive_rate_limits = 0;

        let delay_ms = u64::try_from(self.delay.as_millis()).unwrap_or(self.max_delay_ms);
        self.delay = Duration::from_millis((delay_ms * 3 / 4).max(self.min_delay_ms));

        self.batch_size = (self.batch_size + self.batch_size.div_ceil(4)).min(self.max_batch);
    }

    /// At least one request in the batch hit a rate limit. Returns true when
    /// the consecutive-error threshold was reached and the policy escalated.
    pub fn record_rate_limited_batch(&mut self) -> bool {
        self.consecutive_rate_limits += 1;
        if self.consecutive_rate_limits < self.escalation_threshold {
            return false;
        }

        let delay_ms = u64::try_from(self.delay.as_millis()).unwrap_or(self.max_delay_ms);
        let escalated_ms = (delay_ms * 2).max(self.min_delay_ms.max(1) * 2);
        self.delay = Duration::from_millis(escalated_ms.min(self.max_delay_ms));

        self.batch_size = (self.batch_size / 2).max(self.min_batch);
        true
    }
}
