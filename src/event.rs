//! Canonical transfer-event records and the normalizer that produces them
//! from raw logs.
//!
//! A raw log either decodes into exactly one record (single-asset transfers)
//! or into one record per array position (batch transfers), all sharing the
//! originating (transaction hash, log index) and distinguished by
//! `batch_index`. Anything that does not decode is rejected here, at the
//! boundary, so nothing downstream handles half-formed rows.

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use serde::{Deserialize, Serialize};

use crate::bindings::{IERC721, IERC1155};
use crate::error::DecodeError;

/// The all-zero address: mints arrive from it, burns are sent to it. It is
/// never a holder.
pub const SENTINEL_ADDRESS: Address = Address::ZERO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Single,
    Batch,
}

impl TransferKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Batch => "batch",
        }
    }
}

impl std::str::FromStr for TransferKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "single" => Ok(Self::Single),
            "batch" => Ok(Self::Batch),
            other => Err(format!("invalid transfer kind: {other}")),
        }
    }
}

/// One normalized transfer. Append-only once stored; only the reconciliation
/// duplicate sweep ever deletes rows, and only exact duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub tx_hash: B256,
    pub log_index: u64,
    /// Position within a batch transfer; 0 for single transfers.
    pub batch_index: u32,
    pub block_number: u64,
    pub block_timestamp: i64,
    pub contract: Address,
    pub kind: TransferKind,
    pub operator: Option<Address>,
    pub from: Address,
    pub to: Address,
    pub asset_id: U256,
    pub quantity: U256,
}

impl TransferEvent {
    pub fn is_mint(&self) -> bool {
        self.from == SENTINEL_ADDRESS
    }

    pub fn is_burn(&self) -> bool {
        self.to == SENTINEL_ADDRESS
    }

    /// Fold order: non-decreasing (block, log index, batch index).
    pub const fn ordering_key(&self) -> (u64, u64, u32) {
        (self.block_number, self.log_index, self.batch_index)
    }
}

/// Lowercase hex rendering used for storage, so equality never depends on
/// checksum casing.
pub fn canonical_address(address: &Address) -> String {
    format!("{address:#x}")
}

pub fn canonical_hash(hash: &B256) -> String {
    format!("{hash:#x}")
}

/// Decodes a raw log into normalized transfer records.
///
/// A `TransferBatch` whose id and value arrays disagree in length is a fatal
/// decode error for that log; it is reported, never truncated.
pub fn normalize(log: &Log, block_timestamp: i64) -> Result<Vec<TransferEvent>, DecodeError> {
    let tx_hash = log.transaction_hash.ok_or(DecodeError::MissingTxHash)?;
    let log_index = log.log_index.ok_or(DecodeError::MissingLogIndex)?;
    let block_number = log.block_number.ok_or(DecodeError::MissingBlockNumber)?;
    let contract = log.inner.address;

    let topic0 = log
        .topic0()
        .copied()
        .ok_or(DecodeError::UnknownSignature(None))?;

    if topic0 == IERC721::Transfer::SIGNATURE_HASH {
        let decoded = log.log_decode::<IERC721::Transfer>()?;
        let data = decoded.data();
        Ok(vec![TransferEvent {
            tx_hash,
            log_index,
            batch_index: 0,
            block_number,
            block_timestamp,
            contract,
            kind: TransferKind::Single,
            operator: None,
            from: data.from,
            to: data.to,
            asset_id: data.tokenId,
            quantity: U256::from(1),
        }])
    } else if topic0 == IERC1155::TransferSingle::SIGNATURE_HASH {
        let decoded = log.log_decode::<IERC1155::TransferSingle>()?;
        let data = decoded.data();
        Ok(vec![TransferEvent {
            tx_hash,
            log_index,
            batch_index: 0,
            block_number,
            block_timestamp,
            contract,
            kind: TransferKind::Single,
            operator: Some(data.operator),
            from: data.from,
            to: data.to,
            asset_id: data.id,
            quantity: data.value,
        }])
    } else if topic0 == IERC1155::TransferBatch::SIGNATURE_HASH {
        let decoded = log.log_decode::<IERC1155::TransferBatch>()?;
        let data = decoded.data();
        if data.ids.len() != data.values.len() {
            return Err(DecodeError::BatchLengthMismatch {
                ids: data.ids.len(),
                values: data.values.len(),
            });
        }
        Ok(data
            .ids
            .iter()
            .zip(data.values.iter())
            .enumerate()
            .map(|(position, (id, value))| TransferEvent {
                tx_hash,
                log_index,
                batch_index: u32::try_from(position).unwrap_or(u32::MAX),
                block_number,
                block_timestamp,
                contract,
                kind: TransferKind::Batch,
                operator: Some(data.operator),
                from: data.from,
                to: data.to,
                asset_id: *id,
                quantity: *value,
            })
            .collect())
    } else {
        Err(DecodeError::UnknownSignature(Some(topic0)))
    }
}

/// How many normalized records a set of raw logs expands into, without
/// materializing them. Used by reconciliation to derive authoritative counts.
pub fn expanded_count(logs: &[Log]) -> u64 {
    logs.iter()
        .map(|log| {
            let Some(topic0) = log.topic0().copied() else {
                return 0;
            };
            if topic0 == IERC1155::TransferBatch::SIGNATURE_HASH {
                log.log_decode::<IERC1155::TransferBatch>()
                    .map(|decoded| u64::try_from(decoded.data().ids.len()).unwrap_or(u64::MAX))
                    .unwrap_or(0)
            } else if topic0 == IERC721::Transfer::SIGNATURE_HASH {
                u64::from(log.log_decode::<IERC721::Transfer>().is_ok())
            } else if topic0 == IERC1155::TransferSingle::SIGNATURE_HASH {
                u64::from(log.log_decode::<IERC1155::TransferSingle>().is_ok())
            } else {
                0
            }
        })
        .sum()
}
