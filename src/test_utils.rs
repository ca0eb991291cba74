//! Shared helpers for unit tests: an in-memory database with migrations
//! applied, deterministic event builders and raw-log fabrication.

use alloy::primitives::{Address, B256, IntoLogData, U256, address};
use alloy::rpc::types::Log;
use sqlx::SqlitePool;

use crate::bindings::IERC1155;
use crate::event::{SENTINEL_ADDRESS, TransferEvent, TransferKind};

pub const TEST_HOLDER_A: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
pub const TEST_HOLDER_B: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
pub const TEST_OPERATOR: Address = address!("0xcafecafecafecafecafecafecafecafecafecafe");

pub fn test_contract() -> Address {
    address!("0x1111111111111111111111111111111111111111")
}

/// Creates an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// Deterministic transaction hash derived from (block, log index), so
/// builder-made events and fabricated logs agree on identity.
pub fn synthetic_tx_hash(block_number: u64, log_index: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&block_number.to_be_bytes());
    bytes[8..16].copy_from_slice(&log_index.to_be_bytes());
    bytes[31] = 0xee;
    B256::from(bytes)
}

/// Builder for `TransferEvent` test instances with sensible defaults.
pub struct TransferEventBuilder {
    event: TransferEvent,
    explicit_tx_hash: bool,
}

impl Default for TransferEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEventBuilder {
    pub fn new() -> Self {
        Self {
            event: TransferEvent {
                tx_hash: B256::ZERO,
                log_index: 0,
                batch_index: 0,
                block_number: 100,
                block_timestamp: 0,
                contract: test_contract(),
                kind: TransferKind::Single,
                operator: None,
                from: TEST_HOLDER_A,
                to: TEST_HOLDER_B,
                asset_id: U256::from(1),
                quantity: U256::from(1),
            },
            explicit_tx_hash: false,
        }
    }

    #[must_use]
    pub fn with_block(mut self, block_number: u64) -> Self {
        self.event.block_number = block_number;
        self
    }

    #[must_use]
    pub fn with_log_index(mut self, log_index: u64) -> Self {
        self.event.log_index = log_index;
        self
    }

    #[must_use]
    pub fn with_batch_index(mut self, batch_index: u32) -> Self {
        self.event.batch_index = batch_index;
        self.event.kind = TransferKind::Batch;
        self
    }

    #[must_use]
    pub fn with_tx_hash(mut self, tx_hash: B256) -> Self {
        self.event.tx_hash = tx_hash;
        self.explicit_tx_hash = true;
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: Address) -> Self {
        self.event.from = from;
        self
    }

    #[must_use]
    pub fn with_to(mut self, to: Address) -> Self {
        self.event.to = to;
        self
    }

    #[must_use]
    pub fn with_asset(mut self, asset_id: U256) -> Self {
        self.event.asset_id = asset_id;
        self
    }

    #[must_use]
    pub fn with_quantity(mut self, quantity: U256) -> Self {
        self.event.quantity = quantity;
        self
    }

    #[must_use]
    pub fn mint_to(mut self, holder: Address) -> Self {
        self.event.from = SENTINEL_ADDRESS;
        self.event.to = holder;
        self
    }

    #[must_use]
    pub fn burn_from(mut self, holder: Address) -> Self {
        self.event.from = holder;
        self.event.to = SENTINEL_ADDRESS;
        self
    }

    pub fn build(self) -> TransferEvent {
        let mut event = self.event;
        if !self.explicit_tx_hash {
            event.tx_hash = synthetic_tx_hash(event.block_number, event.log_index);
        }
        event
    }
}

/// Fabricates a raw `TransferSingle` log the way a provider would return
/// it. `mint` routes from the sentinel to holder A, `burn` from holder B to
/// the sentinel, and a plain transfer from A to B.
pub fn transfer_log(
    block_number: u64,
    log_index: u64,
    mint: bool,
    burn: bool,
    quantity: u64,
) -> Log {
    let (from, to) = if mint {
        (SENTINEL_ADDRESS, TEST_HOLDER_A)
    } else if burn {
        (TEST_HOLDER_B, SENTINEL_ADDRESS)
    } else {
        (TEST_HOLDER_A, TEST_HOLDER_B)
    };

    let event = IERC1155::TransferSingle {
        operator: TEST_OPERATOR,
        from,
        to,
        id: U256::from(1),
        value: U256::from(quantity),
    };

    Log {
        inner: alloy::primitives::Log {
            address: test_contract(),
            data: event.to_log_data(),
        },
        block_hash: None,
        block_number: Some(block_number),
        block_timestamp: None,
        transaction_hash: Some(synthetic_tx_hash(block_number, log_index)),
        transaction_index: None,
        log_index: Some(log_index),
        removed: false,
    }
}

/// A minimal RPC block response carrying just what the fetcher reads.
pub fn mock_block(number: u64, timestamp: u64) -> alloy::rpc::types::Block {
    let inner = alloy::consensus::Header {
        number,
        timestamp,
        ..Default::default()
    };
    alloy::rpc::types::Block {
        header: alloy::rpc::types::Header {
            hash: B256::ZERO,
            inner,
            total_difficulty: None,
            size: None,
        },
        uncles: Vec::new(),
        transactions: alloy::rpc::types::BlockTransactions::Hashes(Vec::new()),
        withdrawals: None,
    }
}
