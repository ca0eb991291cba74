//! Domain-specific error types, layered so that upstream, decode, storage and
//! reconciliation failures stay distinguishable all the way up the pipeline.

use alloy::primitives::B256;
use alloy::transports::{RpcError, TransportErrorKind};
use std::time::Duration;

/// Upstream fetch failures, classified by the signal the provider sent back.
///
/// The pipeline reacts differently to each: rate limits feed the adaptive
/// pacing state, oversized responses trigger range bisection, and everything
/// else is retried with bounded backoff.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("upstream rate limit: {0}")]
    RateLimited(String),
    #[error("oversized response for range query: {0}")]
    Oversized(String),
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient upstream error: {0}")]
    Transient(String),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Maps a raw RPC error onto the three failure signals the pipeline
    /// distinguishes. Providers disagree on codes, so the message text is
    /// consulted as well.
    pub fn classify(err: &RpcError<TransportErrorKind>) -> Self {
        if let RpcError::ErrorResp(payload) = err {
            let message = payload.message.to_ascii_lowercase();
            if payload.code == 429
                || message.contains("rate limit")
                || message.contains("too many requests")
            {
                return Self::RateLimited(payload.message.to_string());
            }
            if (message.contains("more than") && message.contains("results"))
                || message.contains("response size")
                || message.contains("query timeout exceeded")
                || (payload.code == -32005 && message.contains("limit"))
            {
                return Self::Oversized(payload.message.to_string());
            }
        }

        let raw = err.to_string();
        let lowered = raw.to_ascii_lowercase();
        if lowered.contains("429")
            || lowered.contains("rate limit")
            || lowered.contains("too many requests")
        {
            Self::RateLimited(raw)
        } else if (lowered.contains("more than") && lowered.contains("results"))
            || lowered.contains("response size")
        {
            Self::Oversized(raw)
        } else {
            Self::Transient(raw)
        }
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub const fn is_oversized(&self) -> bool {
        matches!(self, Self::Oversized(_))
    }
}

/// Per-log decode failures. Fatal for the offending log only; the
/// surrounding window keeps processing.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("log missing transaction hash")]
    MissingTxHash,
    #[error("log missing log index")]
    MissingLogIndex,
    #[error("log missing block number")]
    MissingBlockNumber,
    #[error("unrecognized event signature: {0:?}")]
    UnknownSignature(Option<B256>),
    #[error("malformed event payload: {0}")]
    Payload(#[from] alloy::sol_types::Error),
    #[error("batch transfer arrays disagree: {ids} ids vs {values} values")]
    BatchLengthMismatch { ids: usize, values: usize },
}

/// Database persistence and stored-data corruption errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored value out of range: {0}")]
    Corrupt(String),
}

/// Window-level scan failures surfaced after retries and bisection are
/// exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("window {from}-{to} failed after {attempts} attempts: {source}")]
    WindowFailed {
        from: u64,
        to: u64,
        attempts: usize,
        #[source]
        source: FetchError,
    },
    #[error("single-block window {0} still oversized, cannot bisect further")]
    UnsplittableBlock(u64),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Materialization failures. A negative folded balance is a finding, not an
/// error; only ordering violations and storage failures abort a fold.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("events out of order at block {block} log {log_index}: fold requires non-decreasing (block, log index) order")]
    OutOfOrder { block: u64, log_index: u64 },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Unified error type for the indexing pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("materialize error: {0}")]
    Materialize(#[from] MaterializeError),
}

impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}

impl From<sqlx::Error> for MaterializeError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::rpc::json_rpc::ErrorPayload;

    fn error_resp(code: i64, message: &str) -> RpcError<TransportErrorKind> {
        RpcError::ErrorResp(ErrorPayload {
            code,
            message: message.to_string().into(),
            data: None,
        })
    }

    #[test]
    fn classify_rate_limit_by_code() {
        let err = error_resp(429, "slow down");
        assert!(FetchError::classify(&err).is_rate_limited());
    }

    #[test]
    fn classify_rate_limit_by_message() {
        let err = error_resp(-32000, "Too Many Requests, rate limit reached");
        assert!(FetchError::classify(&err).is_rate_limited());
    }

    #[test]
    fn classify_oversized_by_message() {
        let err = error_resp(-32602, "query returned more than 10000 results");
        assert!(FetchError::classify(&err).is_oversized());
    }

    #[test]
    fn classify_oversized_by_provider_code() {
        let err = error_resp(-32005, "limit exceeded");
        assert!(FetchError::classify(&err).is_oversized());
    }

    #[test]
    fn classify_everything_else_as_transient() {
        let err = error_resp(-32000, "header not found");
        assert!(matches!(
            FetchError::classify(&err),
            FetchError::Transient(_)
        ));
    }

    #[test]
    fn classify_transport_error_by_display() {
        let err = TransportErrorKind::custom_str("connection reset by peer");
        assert!(matches!(
            FetchError::classify(&err),
            FetchError::Transient(_)
        ));
    }
}
