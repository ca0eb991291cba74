use alloy::primitives::Address;
use clap::Parser;
use sqlx::SqlitePool;
use tracing::Level;

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Connection details for the chain and contract a pipeline instance indexes.
#[derive(Parser, Debug, Clone)]
pub struct ChainEnv {
    /// RPC endpoint, ws(s) or http(s)
    #[clap(long, env)]
    pub rpc_url: url::Url,
    /// Token contract to index
    #[clap(long, env)]
    pub contract: Address,
    /// First block the contract could have emitted events in
    #[clap(long, env, default_value = "0")]
    pub deployment_block: u64,
}

/// Tuning knobs for the adaptive batch fetcher. The policy shape is fixed in
/// code; the numbers are a deployment concern.
#[derive(Parser, Debug, Clone)]
pub struct FetcherConfig {
    /// Starting batch size when a call carries fewer than 50 requests
    #[clap(long, env, default_value = "40")]
    pub aggressive_batch: usize,
    /// Starting batch size for 50-99 requests
    #[clap(long, env, default_value = "25")]
    pub medium_batch: usize,
    /// Starting batch size for 100 or more requests
    #[clap(long, env, default_value = "10")]
    pub conservative_batch: usize,
    /// Starting inter-batch delay (ms) when a call carries fewer than 50 requests
    #[clap(long, env, default_value = "50")]
    pub aggressive_delay_ms: u64,
    /// Starting inter-batch delay (ms) for 50-99 requests
    #[clap(long, env, default_value = "200")]
    pub medium_delay_ms: u64,
    /// Starting inter-batch delay (ms) for 100 or more requests
    #[clap(long, env, default_value = "1000")]
    pub conservative_delay_ms: u64,
    /// Floor the inter-batch delay decays toward on clean batches (ms)
    #[clap(long, env, default_value = "25")]
    pub min_delay_ms: u64,
    /// Ceiling for escalated inter-batch delay (ms)
    #[clap(long, env, default_value = "30000")]
    pub max_delay_ms: u64,
    /// Floor for the batch size under emergency throttling
    #[clap(long, env, default_value = "4")]
    pub min_batch: usize,
    /// Ceiling the batch size grows toward on clean batches
    #[clap(long, env, default_value = "100")]
    pub max_batch: usize,
    /// Consecutive rate-limited batches before emergency throttling kicks in
    #[clap(long, env, default_value = "2")]
    pub escalation_threshold: u32,
    /// Per-request timeout (ms)
    #[clap(long, env, default_value = "10000")]
    pub request_timeout_ms: u64,
}

/// Window sizing and retry bounds for the log scanner and the
/// reconciliation pass.
#[derive(Parser, Debug, Clone)]
pub struct ScannerConfig {
    /// Blocks per log-query window during a sync scan
    #[clap(long, env, default_value = "2000")]
    pub window_blocks: u64,
    /// Retry attempts for a window that fails for a non-oversized reason
    #[clap(long, env, default_value = "3")]
    pub window_max_retries: usize,
    /// Initial retry backoff (ms)
    #[clap(long, env, default_value = "1000")]
    pub retry_initial_delay_ms: u64,
    /// Retry backoff ceiling (s)
    #[clap(long, env, default_value = "30")]
    pub retry_max_delay_secs: u64,
    /// Blocks per validation window during reconciliation; coarser than scan windows
    #[clap(long, env, default_value = "10000")]
    pub reconcile_window_blocks: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env, default_value = "holderscan.db")]
    pub database_url: String,
    #[clap(long, env, default_value = "info")]
    pub log_level: LogLevel,
    #[clap(flatten)]
    pub chain: ChainEnv,
    #[clap(flatten)]
    pub fetcher: FetcherConfig,
    #[clap(flatten)]
    pub scanner: ScannerConfig,
    /// Port for the status/query API
    #[clap(long, env, default_value = "8080")]
    pub api_port: u16,
}

impl Env {
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        SqlitePool::connect(&self.database_url).await
    }
}

pub fn setup_tracing(env: &Env) {
    let level: Level = (&env.log_level).into();
    let default_filter = format!("holderscan={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .compact()
        .init();
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use alloy::primitives::address;

    pub fn create_test_fetcher_config() -> FetcherConfig {
        FetcherConfig {
            aggressive_batch: 40,
            medium_batch: 25,
            conservative_batch: 10,
            aggressive_delay_ms: 0,
            medium_delay_ms: 0,
            conservative_delay_ms: 0,
            min_delay_ms: 0,
            max_delay_ms: 30_000,
            min_batch: 4,
            max_batch: 100,
            escalation_threshold: 2,
            request_timeout_ms: 5000,
        }
    }

    pub fn create_test_scanner_config() -> ScannerConfig {
        ScannerConfig {
            window_blocks: 2000,
            window_max_retries: 2,
            retry_initial_delay_ms: 1,
            retry_max_delay_secs: 1,
            reconcile_window_blocks: 10_000,
        }
    }

    pub fn create_test_env() -> Env {
        Env {
            database_url: ":memory:".to_string(),
            log_level: LogLevel::Debug,
            chain: ChainEnv {
                rpc_url: url::Url::parse("ws://localhost:8545").unwrap(),
                contract: address!("0x1111111111111111111111111111111111111111"),
                deployment_block: 1,
            },
            fetcher: create_test_fetcher_config(),
            scanner: create_test_scanner_config(),
            api_port: 8080,
        }
    }

    #[test]
    fn log_level_conversion() {
        let level: Level = (&LogLevel::Trace).into();
        assert_eq!(Level::TRACE, level);

        let level: Level = (&LogLevel::Error).into();
        assert_eq!(Level::ERROR, level);
    }

    #[tokio::test]
    async fn sqlite_pool_creation() {
        let env = create_test_env();
        let pool_result = env.get_sqlite_pool().await;
        assert!(pool_result.is_ok());
    }

    #[test]
    fn env_construction() {
        let env = create_test_env();
        assert_eq!(env.database_url, ":memory:");
        assert_eq!(env.chain.deployment_block, 1);
        assert_eq!(env.fetcher.escalation_threshold, 2);
        assert_eq!(env.scanner.window_blocks, 2000);
    }
}
