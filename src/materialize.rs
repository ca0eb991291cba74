//! Derived per-holder balances, rebuilt or incrementally advanced by folding
//! the ordered event log.
//!
//! The holder-position table is a projection: this module is its only
//! writer. A full rebuild replaces the whole projection inside one
//! transaction so readers never observe a half-rebuilt state. Balances are
//! `U256` throughout; a pair that folds to zero is removed and a pair that
//! folds negative is reported as an anomaly, never clamped or persisted.

use std::collections::HashMap;
use std::str::FromStr;

use alloy::primitives::{Address, U256};
use itertools::Itertools;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{MaterializeError, PersistenceError};
use crate::event::{SENTINEL_ADDRESS, TransferEvent, canonical_address};
use crate::store::EventStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderPosition {
    pub contract: Address,
    pub holder: Address,
    pub asset_id: U256,
    pub balance: U256,
    pub last_block: u64,
}

/// A (holder, asset) pair whose outgoing quantities exceed its incoming
/// ones. Indicates missing events; surfaced to reconciliation, never
/// silently corrected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceAnomaly {
    pub holder: Address,
    pub asset_id: U256,
    pub deficit: U256,
    pub last_block: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    credit: U256,
    debit: U256,
    last_block: u64,
}

#[derive(Debug)]
pub struct FoldOutcome {
    pub positions: Vec<HolderPosition>,
    pub anomalies: Vec<BalanceAnomaly>,
}

#[derive(Debug)]
pub struct RebuildSummary {
    pub positions: usize,
    pub anomalies: Vec<BalanceAnomaly>,
}

/// Sums incoming and outgoing quantities per (holder, asset), rejecting
/// out-of-order input. Ordering is a correctness requirement: later events
/// are definitionally later state.
fn fold_deltas(
    events: &[TransferEvent],
) -> Result<HashMap<(Address, U256), Accumulator>, MaterializeError> {
    let mut previous: Option<(u64, u64, u32)> = None;
    let mut accumulators: HashMap<(Address, U256), Accumulator> = HashMap::new();

    for event in events {
        let key = event.ordering_key();
        if let Some(previous_key) = previous {
            if key < previous_key {
                return Err(MaterializeError::OutOfOrder {
                    block: event.block_number,
                    log_index: event.log_index,
                });
            }
        }
        previous = Some(key);

        if event.from != SENTINEL_ADDRESS {
            let accumulator = accumulators
                .entry((event.from, event.asset_id))
                .or_default();
            accumulator.debit = accumulator.debit.saturating_add(event.quantity);
            accumulator.last_block = accumulator.last_block.max(event.block_number);
        }
        if event.to != SENTINEL_ADDRESS {
            let accumulator = accumulators.entry((event.to, event.asset_id)).or_default();
            accumulator.credit = accumulator.credit.saturating_add(event.quantity);
            accumulator.last_block = accumulator.last_block.max(event.block_number);
        }
    }

    Ok(accumulators)
}

/// Folds an ordered event slice into positions and anomalies. Pairs that net
/// to zero are omitted entirely.
pub fn fold(contract: Address, events: &[TransferEvent]) -> Result<FoldOutcome, MaterializeError> {
    let accumulators = fold_deltas(events)?;

    let mut positions = Vec::new();
    let mut anomalies = Vec::new();

    for ((holder, asset_id), accumulator) in accumulators
        .into_iter()
        .sorted_by_key(|((holder, asset_id), _)| (*holder, *asset_id))
    {
        match accumulator.credit.checked_sub(accumulator.debit) {
            Some(balance) if balance.is_zero() => {}
            Some(balance) => positions.push(HolderPosition {
                contract,
                holder,
                asset_id,
                balance,
                last_block: accumulator.last_block,
            }),
            None => anomalies.push(BalanceAnomaly {
                holder,
                asset_id,
                deficit: accumulator.debit.saturating_sub(accumulator.credit),
                last_block: accumulator.last_block,
            }),
        }
    }

    Ok(FoldOutcome {
        positions,
        anomalies,
    })
}

#[derive(Debug, sqlx::FromRow)]
struct PositionRow {
    contract: String,
    holder: String,
    asset_id: String,
    balance: String,
    last_block: i64,
}

impl TryFrom<PositionRow> for HolderPosition {
    type Error = PersistenceError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        let parse_address = |value: &str, what: &str| {
            Address::from_str(value).map_err(|error| {
                PersistenceError::Corrupt(format!("{what} unparseable: {value}: {error}"))
            })
        };
        let parse_u256 = |value: &str, what: &str| {
            U256::from_str(value).map_err(|error| {
                PersistenceError::Corrupt(format!("{what} unparseable: {value}: {error}"))
            })
        };

        Ok(Self {
            contract: parse_address(&row.contract, "contract")?,
            holder: parse_address(&row.holder, "holder")?,
            asset_id: parse_u256(&row.asset_id, "asset id")?,
            balance: parse_u256(&row.balance, "balance")?,
            last_block: u64::try_from(row.last_block).map_err(|_| {
                PersistenceError::Corrupt(format!("last block negative: {}", row.last_block))
            })?,
        })
    }
}

const SELECT_POSITIONS: &str =
    "SELECT contract, holder, asset_id, balance, last_block FROM holder_positions";

/// Sole writer of the holder-position projection.
#[derive(Debug, Clone)]
pub struct Materializer {
    pool: SqlitePool,
    store: EventStore,
}

impl Materializer {
    pub fn new(pool: SqlitePool) -> Self {
        let store = EventStore::new(pool.clone());
        Self { pool, store }
    }

    /// Recomputes every position for a contract from the full ordered event
    /// log and atomically swaps the projection.
    pub async fn rebuild_all(&self, contract: Address) -> Result<RebuildSummary, MaterializeError> {
        let events = self.store.all_events(contract).await?;
        let outcome = fold(contract, &events)?;

        for anomaly in &outcome.anomalies {
            warn!(
                holder = %anomaly.holder,
                asset = %anomaly.asset_id,
                deficit = %anomaly.deficit,
                "negative folded balance, position omitted"
            );
        }

        let mut sql_tx = self.pool.begin().await.map_err(PersistenceError::from)?;

        sqlx::query("DELETE FROM holder_positions WHERE contract = ?1")
            .bind(canonical_address(&contract))
            .execute(sql_tx.as_mut())
            .await
            .map_err(PersistenceError::from)?;

        for position in &outcome.positions {
            insert_position(&mut sql_tx, position).await?;
        }

        sql_tx.commit().await.map_err(PersistenceError::from)?;

        info!(
            contract = %contract,
            positions = outcome.positions.len(),
            anomalies = outcome.anomalies.len(),
            "holder positions rebuilt"
        );

        Ok(RebuildSummary {
            positions: outcome.positions.len(),
            anomalies: outcome.anomalies,
        })
    }

    /// Advances the projection by the deltas of newly appended events
    /// without recomputing untouched pairs. New events must themselves be in
    /// fold order and at-or-after everything already applied.
    pub async fn apply_incremental(
        &self,
        contract: Address,
        new_events: &[TransferEvent],
    ) -> Result<RebuildSummary, MaterializeError> {
        let deltas = fold_deltas(new_events)?;

        let mut anomalies = Vec::new();
        let mut touched = 0usize;
        let mut sql_tx = self.pool.begin().await.map_err(PersistenceError::from)?;

        for ((holder, asset_id), accumulator) in deltas
            .into_iter()
            .sorted_by_key(|((holder, asset_id), _)| (*holder, *asset_id))
        {
            let existing: Option<(String, i64)> = sqlx::query_as(
                "SELECT balance, last_block FROM holder_positions \
                 WHERE contract = ?1 AND holder = ?2 AND asset_id = ?3",
            )
            .bind(canonical_address(&contract))
            .bind(canonical_address(&holder))
            .bind(asset_id.to_string())
            .fetch_optional(sql_tx.as_mut())
            .await
            .map_err(PersistenceError::from)?;

            let (current, current_block) = match &existing {
                Some((balance, last_block)) => (
                    U256::from_str(balance).map_err(|error| {
                        PersistenceError::Corrupt(format!(
                            "balance unparseable: {balance}: {error}"
                        ))
                    })?,
                    u64::try_from(*last_block).unwrap_or(0),
                ),
                None => (U256::ZERO, 0),
            };

            let last_block = current_block.max(accumulator.last_block);
            let credited = current.saturating_add(accumulator.credit);
            touched += 1;

            match credited.checked_sub(accumulator.debit) {
                Some(balance) if balance.is_zero() => {
                    delete_position(&mut sql_tx, contract, holder, asset_id).await?;
                }
                Some(balance) => {
                    upsert_position(
                        &mut sql_tx,
                        &HolderPosition {
                            contract,
                            holder,
                            asset_id,
                            balance,
                            last_block,
                        },
                    )
                    .await?;
                }
                None => {
                    warn!(
                        holder = %holder,
                        asset = %asset_id,
                        "incremental fold went negative, position removed and reported"
                    );
                    anomalies.push(BalanceAnomaly {
                        holder,
                        asset_id,
                        deficit: accumulator.debit.saturating_sub(credited),
                        last_block,
                    });
                    delete_position(&mut sql_tx, contract, holder, asset_id).await?;
                }
            }
        }

        sql_tx.commit().await.map_err(PersistenceError::from)?;

        Ok(RebuildSummary {
            positions: touched,
            anomalies,
        })
    }

    pub async fn positions_for_contract(
        &self,
        contract: Address,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HolderPosition>, PersistenceError> {
        let query = format!(
            "{SELECT_POSITIONS} WHERE contract = ?1 ORDER BY holder, asset_id LIMIT ?2 OFFSET ?3"
        );
        let rows: Vec<PositionRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(HolderPosition::try_from).collect()
    }

    pub async fn positions_for_holder(
        &self,
        contract: Address,
        holder: Address,
    ) -> Result<Vec<HolderPosition>, PersistenceError> {
        let query =
            format!("{SELECT_POSITIONS} WHERE contract = ?1 AND holder = ?2 ORDER BY asset_id");
        let rows: Vec<PositionRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(canonical_address(&holder))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(HolderPosition::try_from).collect()
    }

    pub async fn positions_for_asset(
        &self,
        contract: Address,
        asset_id: U256,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<HolderPosition>, PersistenceError> {
        let query = format!(
            "{SELECT_POSITIONS} WHERE contract = ?1 AND asset_id = ?2 \
             ORDER BY holder LIMIT ?3 OFFSET ?4"
        );
        let rows: Vec<PositionRow> = sqlx::query_as(&query)
            .bind(canonical_address(&contract))
            .bind(asset_id.to_string())
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(HolderPosition::try_from).collect()
    }
}

async fn insert_position(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    position: &HolderPosition,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO holder_positions (contract, holder, asset_id, balance, last_block) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(canonical_address(&position.contract))
    .bind(canonical_address(&position.holder))
    .bind(position.asset_id.to_string())
    .bind(position.balance.to_string())
    .bind(i64::try_from(position.last_block).map_err(|_| {
        PersistenceError::Corrupt(format!("last block out of range: {}", position.last_block))
    })?)
    .execute(sql_tx.as_mut())
    .await?;
    Ok(())
}

async fn upsert_position(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    position: &HolderPosition,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO holder_positions (contract, holder, asset_id, balance, last_block) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT (contract, holder, asset_id) DO UPDATE \
         SET balance = excluded.balance, last_block = excluded.last_block, \
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(canonical_address(&position.contract))
    .bind(canonical_address(&position.holder))
    .bind(position.asset_id.to_string())
    .bind(position.balance.to_string())
    .bind(i64::try_from(position.last_block).map_err(|_| {
        PersistenceError::Corrupt(format!("last block out of range: {}", position.last_block))
    })?)
    .execute(sql_tx.as_mut())
    .await?;
    Ok(())
}

async fn delete_position(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    contract: Address,
    holder: Address,
    asset_id: U256,
) -> Result<(), PersistenceError> {
    sqlx::query(
        "DELETE FROM holder_positions WHERE contract = ?1 AND holder = ?2 AND asset_id = ?3",
    )
    .bind(canonical_address(&contract))
    .bind(canonical_address(&holder))
    .bind(asset_id.to_string())
    .execute(sql_tx.as_mut())
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TransferEventBuilder, setup_test_db, test_contract};
    use alloy::primitives::address;
    use proptest::prelude::*;

    const HOLDER_A: Address = address!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const HOLDER_B: Address = address!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    fn mint_transfer_burn() -> Vec<TransferEvent> {
        vec![
            TransferEventBuilder::new()
                .with_block(100)
                .mint_to(HOLDER_A)
                .with_quantity(U256::from(10))
                .build(),
            TransferEventBuilder::new()
                .with_block(101)
                .with_from(HOLDER_A)
                .with_to(HOLDER_B)
                .with_quantity(U256::from(4))
                .build(),
            TransferEventBuilder::new()
                .with_block(102)
                .burn_from(HOLDER_B)
                .with_quantity(U256::from(2))
                .build(),
        ]
    }

    #[test]
    fn fold_mint_transfer_burn_scenario() {
        let outcome = fold(test_contract(), &mint_transfer_burn()).unwrap();

        assert_eq!(outcome.positions.len(), 2);
        assert!(outcome.anomalies.is_empty());

        let a = outcome
            .positions
            .iter()
            .find(|p| p.holder == HOLDER_A)
            .unwrap();
        let b = outcome
            .positions
            .iter()
            .find(|p| p.holder == HOLDER_B)
            .unwrap();

        assert_eq!(a.balance, U256::from(6));
        assert_eq!(a.last_block, 101);
        assert_eq!(b.balance, U256::from(2));
        assert_eq!(b.last_block, 102);
    }

    #[test]
    fn fold_omits_pairs_that_net_to_zero() {
        let events = vec![
            TransferEventBuilder::new()
                .with_block(100)
                .mint_to(HOLDER_A)
                .with_quantity(U256::from(5))
                .build(),
            TransferEventBuilder::new()
                .with_block(101)
                .with_from(HOLDER_A)
                .with_to(HOLDER_B)
                .with_quantity(U256::from(5))
                .build(),
        ];

        let outcome = fold(test_contract(), &events).unwrap();

        assert_eq!(outcome.positions.len(), 1);
        assert_eq!(outcome.positions[0].holder, HOLDER_B);
    }

    #[test]
    fn fold_reports_negative_balance_as_anomaly() {
        let events = vec![
            TransferEventBuilder::new()
                .with_block(100)
                .with_from(HOLDER_A)
                .with_to(HOLDER_B)
                .with_quantity(U256::from(3))
                .build(),
        ];

        let outcome = fold(test_contract(), &events).unwrap();

        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(outcome.anomalies[0].holder, HOLDER_A);
        assert_eq!(outcome.anomalies[0].deficit, U256::from(3));
        // The recipient still has a valid position.
        assert_eq!(outcome.positions.len(), 1);
        assert_eq!(outcome.positions[0].holder, HOLDER_B);
    }

    #[test]
    fn fold_rejects_events_shuffled_within_a_block() {
        let events = vec![
            TransferEventBuilder::new()
                .with_block(100)
                .with_log_index(5)
                .mint_to(HOLDER_A)
                .build(),
            TransferEventBuilder::new()
                .with_block(100)
                .with_log_index(2)
                .mint_to(HOLDER_B)
                .build(),
        ];

        assert!(matches!(
            fold(test_contract(), &events),
            Err(MaterializeError::OutOfOrder {
                block: 100,
                log_index: 2
            })
        ));
    }

    #[test]
    fn sentinel_never_accumulates() {
        let events = vec![
            TransferEventBuilder::new()
                .with_block(100)
                .with_from(SENTINEL_ADDRESS)
                .with_to(SENTINEL_ADDRESS)
                .with_quantity(U256::from(50))
                .build(),
        ];

        let outcome = fold(test_contract(), &events).unwrap();

        assert!(outcome.positions.is_empty());
        assert!(outcome.anomalies.is_empty());
    }

    #[tokio::test]
    async fn rebuild_persists_positions_atomically() {
        let pool = setup_test_db().await;
        let store = EventStore::new(pool.clone());
        let materializer = Materializer::new(pool);

        store.append(&mint_transfer_burn()).await.unwrap();
        let summary = materializer.rebuild_all(test_contract()).await.unwrap();

        assert_eq!(summary.positions, 2);
        assert!(summary.anomalies.is_empty());

        let positions = materializer
            .positions_for_holder(test_contract(), HOLDER_A)
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].balance, U256::from(6));
    }

    #[tokio::test]
    async fn rebuild_replaces_stale_projection() {
        let pool = setup_test_db().await;
        let store = EventStore::new(pool.clone());
        let materializer = Materializer::new(pool);

        store.append(&mint_transfer_burn()).await.unwrap();
        materializer.rebuild_all(test_contract()).await.unwrap();

        // B burns the rest; B's position must disappear on the next rebuild.
        store
            .append(&[TransferEventBuilder::new()
                .with_block(103)
                .burn_from(HOLDER_B)
                .with_quantity(U256::from(2))
                .build()])
            .await
            .unwrap();
        materializer.rebuild_all(test_contract()).await.unwrap();

        let positions = materializer
            .positions_for_holder(test_contract(), HOLDER_B)
            .await
            .unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn incremental_matches_full_rebuild() {
        let pool = setup_test_db().await;
        let store = EventStore::new(pool.clone());
        let materializer = Materializer::new(pool);

        let events = mint_transfer_burn();
        store.append(&events).await.unwrap();

        // Apply the first two events, then the third incrementally.
        materializer
            .apply_incremental(test_contract(), &events[..2])
            .await
            .unwrap();
        materializer
            .apply_incremental(test_contract(), &events[2..])
            .await
            .unwrap();

        let incremental = materializer
            .positions_for_contract(test_contract(), 100, 0)
            .await
            .unwrap();

        materializer.rebuild_all(test_contract()).await.unwrap();
        let rebuilt = materializer
            .positions_for_contract(test_contract(), 100, 0)
            .await
            .unwrap();

        assert_eq!(incremental, rebuilt);
    }

    #[tokio::test]
    async fn incremental_removes_zeroed_positions() {
        let pool = setup_test_db().await;
        let materializer = Materializer::new(pool);

        let mint = TransferEventBuilder::new()
            .with_block(100)
            .mint_to(HOLDER_A)
            .with_quantity(U256::from(5))
            .build();
        let burn = TransferEventBuilder::new()
            .with_block(101)
            .burn_from(HOLDER_A)
            .with_quantity(U256::from(5))
            .build();

        materializer
            .apply_incremental(test_contract(), &[mint])
            .await
            .unwrap();
        materializer
            .apply_incremental(test_contract(), &[burn])
            .await
            .unwrap();

        let positions = materializer
            .positions_for_holder(test_contract(), HOLDER_A)
            .await
            .unwrap();
        assert!(positions.is_empty());
    }

    proptest! {
        #[test]
        fn mints_conserve_total_supply(quantities in prop::collection::vec(1u64..1000, 1..20)) {
            let events: Vec<TransferEvent> = quantities
                .iter()
                .enumerate()
                .map(|(i, &quantity)| {
                    let holder = if i % 2 == 0 { HOLDER_A } else { HOLDER_B };
                    TransferEventBuilder::new()
                        .with_block(100 + u64::try_from(i).unwrap_or(0))
                        .mint_to(holder)
                        .with_quantity(U256::from(quantity))
                        .build()
                })
                .collect();

            let outcome = fold(test_contract(), &events).unwrap();
            prop_assert!(outcome.anomalies.is_empty());

            let total: U256 = outcome
                .positions
                .iter()
                .fold(U256::ZERO, |sum, p| sum.saturating_add(p.balance));
            let minted: U256 = quantities
                .iter()
                .fold(U256::ZERO, |sum, &q| sum.saturating_add(U256::from(q)));
            prop_assert_eq!(total, minted);
        }
    }
}
