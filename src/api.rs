//! Read-only HTTP surface for downstream consumers: holder positions,
//! transfer history and sync status.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Route, State, get, routes};
use serde::Serialize;
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::event::{TransferEvent, canonical_address, canonical_hash};
use crate::materialize::{HolderPosition, Materializer};
use crate::store::EventStore;
use crate::sync::{SyncCursor, load_cursor};

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[get("/health")]
pub fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

#[derive(Serialize)]
pub struct PositionResponse {
    pub contract: String,
    pub holder: String,
    pub asset_id: String,
    pub balance: String,
    pub last_block: u64,
}

impl From<HolderPosition> for PositionResponse {
    fn from(position: HolderPosition) -> Self {
        Self {
            contract: canonical_address(&position.contract),
            holder: canonical_address(&position.holder),
            asset_id: position.asset_id.to_string(),
            balance: position.balance.to_string(),
            last_block: position.last_block,
        }
    }
}

#[derive(Serialize)]
pub struct EventResponse {
    pub tx_hash: String,
    pub log_index: u64,
    pub batch_index: u32,
    pub block_number: u64,
    pub block_timestamp: i64,
    pub kind: String,
    pub operator: Option<String>,
    pub from: String,
    pub to: String,
    pub asset_id: String,
    pub quantity: String,
}

impl From<TransferEvent> for EventResponse {
    fn from(event: TransferEvent) -> Self {
        Self {
            tx_hash: canonical_hash(&event.tx_hash),
            log_index: event.log_index,
            batch_index: event.batch_index,
            block_number: event.block_number,
            block_timestamp: event.block_timestamp,
            kind: event.kind.as_str().to_string(),
            operator: event.operator.as_ref().map(canonical_address),
            from: canonical_address(&event.from),
            to: canonical_address(&event.to),
            asset_id: event.asset_id.to_string(),
            quantity: event.quantity.to_string(),
        }
    }
}

fn parse_contract(raw: &str) -> Result<Address, Status> {
    Address::from_str(raw).map_err(|_| Status::BadRequest)
}

fn page_bounds(limit: Option<u32>, offset: Option<u32>) -> (u32, u32) {
    (
        limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
        offset.unwrap_or(0),
    )
}

#[get("/positions?<contract>&<holder>&<asset>&<limit>&<offset>")]
pub async fn positions(
    contract: &str,
    holder: Option<&str>,
    asset: Option<&str>,
    limit: Option<u32>,
    offset: Option<u32>,
    pool: &State<SqlitePool>,
) -> Result<Json<Vec<PositionResponse>>, Status> {
    let contract = parse_contract(contract)?;
    let (limit, offset) = page_bounds(limit, offset);
    let materializer = Materializer::new(pool.inner().clone());

    let positions = match (holder, asset) {
        (Some(holder), _) => {
            let holder = Address::from_str(holder).map_err(|_| Status::BadRequest)?;
            materializer.positions_for_holder(contract, holder).await
        }
        (None, Some(asset)) => {
            let asset = U256::from_str(asset).map_err(|_| Status::BadRequest)?;
            materializer
                .positions_for_asset(contract, asset, limit, offset)
                .await
        }
        (None, None) => {
            materializer
                .positions_for_contract(contract, limit, offset)
                .await
        }
    }
    .map_err(|_| Status::InternalServerError)?;

    Ok(Json(positions.into_iter().map(Into::into).collect()))
}

#[get("/events?<contract>&<address>&<asset>&<from_block>&<to_block>&<limit>&<offset>")]
#[allow(clippy::too_many_arguments)]
pub async fn events(
    contract: &str,
    address: Option<&str>,
    asset: Option<&str>,
    from_block: Option<u64>,
    to_block: Option<u64>,
    limit: Option<u32>,
    offset: Option<u32>,
    pool: &State<SqlitePool>,
) -> Result<Json<Vec<EventResponse>>, Status> {
    let contract = parse_contract(contract)?;
    let (limit, offset) = page_bounds(limit, offset);
    let store = EventStore::new(pool.inner().clone());

    let from = from_block.unwrap_or(0);
    let to = to_block.unwrap_or(i64::MAX as u64);

    let events = match (address, asset) {
        (Some(address), _) => {
            let address = Address::from_str(address).map_err(|_| Status::BadRequest)?;
            store
                .events_for_address(contract, address, limit, offset)
                .await
        }
        (None, Some(asset)) => {
            let asset = U256::from_str(asset).map_err(|_| Status::BadRequest)?;
            store.events_for_asset(contract, asset, limit, offset).await
        }
        (None, None) => store.events_page(contract, from, to, limit, offset).await,
    }
    .map_err(|_| Status::InternalServerError)?;

    Ok(Json(events.into_iter().map(Into::into).collect()))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub cursor: Option<SyncCursor>,
}

#[get("/status?<contract>")]
pub async fn status(
    contract: &str,
    pool: &State<SqlitePool>,
) -> Result<Json<StatusResponse>, Status> {
    let contract = parse_contract(contract)?;
    let cursor = load_cursor(pool.inner(), contract)
        .await
        .map_err(|_| Status::InternalServerError)?;

    Ok(Json(StatusResponse { cursor }))
}

// Route Configuration
pub fn routes() -> Vec<Route> {
    routes![health, positions, events, status]
}
