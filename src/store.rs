//! Append-only persistence for normalized transfer events.
//!
//! Appends are insert-if-absent on the canonical key
//! (contract, tx hash, log index, batch index) and run inside a single
//! transaction per batch, so a partially stored window is never visible.
//! Re-appending an already-stored event is a no-op, which makes overlapping
//! re-scans safe.

use alloy::primitives::{Address, B256, U256};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::PersistenceError;
use crate::event::{
    SENTINEL_ADDRESS, TransferEvent, TransferKind, canonical_address, canonical_hash,
};

#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

/// A key that appears more than once in storage. Only produced when
/// concurrent overlapping scans race past the append guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub tx_hash: String,
    pub log_index: u64,
    pub batch_index: u32,
    pub count: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    tx_hash: String,
    log_index: i64,
    batch_index: i64,
    block_number: i64,
    block_timestamp: i64,
    contract: String,
    kind: String,
    operator: Option<String>,
    from_address: String,
    to_address: String,
    asset_id: String,
    quantity: String,
}

fn to_i64(value: u64, what: &str) -> Result<i64, PersistenceError> {
    i64::try_from(value)
        .map_err(|_| PersistenceError::Corrupt(format!("{what} out of range: {value}")))
}

fn to_u64(value: i64, what: &str) -> Result<u64, PersistenceError> {
    u64::try_from(value)
        .map_err(|_| PersistenceError::Corrupt(format!("{what} negative in storage: {value}")))
}

fn parse_address(value: &str, what: &str) -> Result<Address, PersistenceError> {
    Address::from_str(value)
        .map_err(|error| PersistenceError::Corrupt(format!("{what} unparseable: {value}: {error}")))
}

fn parse_u256(value: &str, what: &str) -> Result<U256, PersistenceError> {
    U256::from_str(value)
        .map_err(|error| PersistenceError::Corrupt(format!("{what} unparseable: {value}: {error}")))
}

impl TryFrom<EventRow> for TransferEvent {
    type Error = PersistenceError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            tx_hash: B256::from_str(&row.tx_hash).map_err(|error| {
                PersistenceError::Corrupt(format!("tx hash unparseable: {}: {error}", row.tx_hash))
            })?,
            log_index: to_u64(row.log_index, "log index")?,
            batch_index: u32::try_from(row.batch_index).map_err(|_| {
                PersistenceError::Corrupt(format!("batch index out of range: {}", row.batch_index))
            })?,
            block_number: to_u64(row.block_number, "block number")?,
            block_timestamp: row.block_timestamp,
            contract: parse_address(&row.contract, "contract")?,
            kind: TransferKind::from_str(&row.kind).map_err(PersistenceError::Corrupt)?,
            operator: row
                .operator
                .as_deref()
                .map(|operator| parse_address(operator, "operator"))
                .transpose()?,
            from: parse_address(&row.from_address, "from address")?,
            to: parse_address(&row.to_address, "to address")?,
            asset_id: parse_u256(&row.asset_id, "asset id")?,
            quantity: parse_u256(&row.quantity, "quantity")?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT tx_hash, log_index, batch_index, block_number, \
     block_timestamp, contract, kind, operator, from_address, to_address, asset_id, quantity \
     FROM transfer_events";

const ORDER_BY_FOLD: &str = "ORDER BY block_number ASC, log_index ASC, batch_index ASC";

impl EventStore {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Appends events inside one transaction, skipping any whose canonical
    /// key is already stored. Returns how many rows were actually inserted.
    pub async fn append(&self, events: &[TransferEvent]) -> Result<u64, PersistenceError> {
        let mut sql_tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for event in events {
            let contract = canonical_address(&event.contract);
            let tx_hash = canonical_hash(&event.tx_hash);
            let log_index = to_i64(event.log_index, "log index")?;
            let batch_index = i64::from(event.batch_index);
            let block_number = to_i64(event.block_number, "block number")?;
            let operator = event.operator.as_ref().map(canonical_address);
            let from_address = canonical_address(&event.from);
            let to_address = canonical_address(&event.to);
            let asset_id = event.asset_id.to_string();
            let quantity = event.quantity.to_string();

            let result = sqlx::query(
                r"
                INSERT INTO transfer_events
                    (contract, tx_hash, log_index, batch_index, block_number, block_timestamp,
                     kind, operator, from_address, to_address, asset_id, quantity)
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
                WHERE NOT EXISTS (
                    SELECT 1 FROM transfer_events
                    WHERE contract = ?1 AND tx_hash = ?2 AND log_index = ?3 AND batch_index = ?4
                )
                ",
            )
            .bind(&contract)
            .bind(&tx_hash)
            .bind(log_index)
            .bind(batch_index)
            .bind(block_number)
            .bind(event.block_timestamp)
            .bind(event.kind.as_str())
            .bind(&operator)
            .bind(&from_address)
            .bind(&to_address)
            .bind(&asset_id)
            .bind(&quantity)
            .execute(sql_tx.as_mut())
            .await?;

            inserted += result.rows_affected();
        }

        sql_tx.commit().await?;
        Ok(inserted)
    }

    /// Stored expanded-record count for an inclusive block range.
    pub async fn count_in_range(
        &self,
        contract: Address,
        from: u64,
        to: u64,
    ) -> Result<u64, PersistenceError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transfer_events \
             WHERE contract = ?1 AND block_number BETWEEN ?2 AND ?3",
        )
        .bind(canonical_address(&contract))
        .bind(to_i64(from, "from block")?)
        .bind(to_i64(to, "to block")?)
        .fetch_one(&self.pool)
        .await?;

        to_u64(row.0, "count")
    }

    /// All events for a contract in fold order.
    pub async fn all_events(&self, contract: Address) -> Result<Vec<TransferEvent>, PersistenceError> {
        let query = format!("{SELECT_COLUMNS} WHERE contract = ?1 {ORDER_BY_FOLD}");
        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferEvent::try_from).collect()
    }

    /// Events within an inclusive block range, in fold order.
    pub async fn events_in_range(
        &self,
        contract: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransferEvent>, PersistenceError> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE contract = ?1 AND block_number BETWEEN ?2 AND ?3 {ORDER_BY_FOLD}"
        );
        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(to_i64(from, "from block")?)
            .bind(to_i64(to, "to block")?)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferEvent::try_from).collect()
    }

    /// Paginated history for one address, as sender or recipient.
    pub async fn events_for_address(
        &self,
        contract: Address,
        address: Address,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TransferEvent>, PersistenceError> {
        let canonical = canonical_address(&address);
        let query = format!(
            "{SELECT_COLUMNS} WHERE contract = ?1 AND (from_address = ?2 OR to_address = ?2) \
             {ORDER_BY_FOLD} LIMIT ?3 OFFSET ?4"
        );
        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(&canonical)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferEvent::try_from).collect()
    }

    /// Paginated history for one asset.
    pub async fn events_for_asset(
        &self,
        contract: Address,
        asset_id: U256,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TransferEvent>, PersistenceError> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE contract = ?1 AND asset_id = ?2 \
             {ORDER_BY_FOLD} LIMIT ?3 OFFSET ?4"
        );
        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(asset_id.to_string())
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferEvent::try_from).collect()
    }

    /// Paginated slice of a block range, oldest first.
    pub async fn events_page(
        &self,
        contract: Address,
        from: u64,
        to: u64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TransferEvent>, PersistenceError> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE contract = ?1 AND block_number BETWEEN ?2 AND ?3 \
             {ORDER_BY_FOLD} LIMIT ?4 OFFSET ?5"
        );
        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(to_i64(from, "from block")?)
            .bind(to_i64(to, "to block")?)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferEvent::try_from).collect()
    }

    /// Mint and burn rows for a range, in fold order. Used to derive the
    /// stored net supply.
    pub async fn supply_events(
        &self,
        contract: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<TransferEvent>, PersistenceError> {
        let sentinel = canonical_address(&SENTINEL_ADDRESS);
        let query = format!(
            "{SELECT_COLUMNS} WHERE contract = ?1 AND block_number BETWEEN ?2 AND ?3 \
             AND (from_address = ?4 OR to_address = ?4) {ORDER_BY_FOLD}"
        );
        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(to_i64(from, "from block")?)
            .bind(to_i64(to, "to block")?)
            .bind(&sentinel)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransferEvent::try_from).collect()
    }

    /// Canonical keys stored more than once.
    pub async fn find_duplicates(
        &self,
        contract: Address,
    ) -> Result<Vec<DuplicateGroup>, PersistenceError> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT tx_hash, log_index, batch_index, COUNT(*) AS occurrences \
             FROM transfer_events WHERE contract = ?1 \
             GROUP BY tx_hash, log_index, batch_index \
             HAVING COUNT(*) > 1 \
             ORDER BY tx_hash, log_index, batch_index",
        )
        .bind(canonical_address(&contract))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(tx_hash, log_index, batch_index, count)| {
                Ok(DuplicateGroup {
                    tx_hash,
                    log_index: to_u64(log_index, "log index")?,
                    batch_index: u32::try_from(batch_index).map_err(|_| {
                        PersistenceError::Corrupt(format!(
                            "batch index out of range: {batch_index}"
                        ))
                    })?,
                    count: to_u64(count, "duplicate count")?,
                })
            })
            .collect()
    }

    /// Deletes every row whose full payload is identical to an
    /// earlier-inserted row, keeping exactly one per payload. Rows that share
    /// a key but differ in any field are left untouched; they are a
    /// consistency finding, not a duplicate.
    pub async fn remove_duplicates_keeping_one(
        &self,
        contract: Address,
    ) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "DELETE FROM transfer_events \
             WHERE contract = ?1 AND id NOT IN ( \
                 SELECT MIN(id) FROM transfer_events WHERE contract = ?1 \
                 GROUP BY tx_hash, log_index, batch_index, block_number, block_timestamp, \
                          kind, operator, from_address, to_address, asset_id, quantity \
             )",
        )
        .bind(canonical_address(&contract))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
