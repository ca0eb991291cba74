//! Reconciliation of stored state against the authoritative chain.
//!
//! Validation compares stored event counts per window and the stored net
//! supply against what the upstream source reports for the same ranges.
//! Findings live only for the duration of a run; what persists is the
//! summary recorded on the sync cursor. Auto-fix only ever adds missing
//! events and removes exact duplicates, then rebuilds the projection and
//! re-validates once.

use alloy::primitives::U256;
use alloy::providers::Provider;
use alloy::rpc::types::Log;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::env::ChainEnv;
use crate::error::IndexerError;
use crate::event::{self, TransferEvent};
use crate::materialize::Materializer;
use crate::scanner::{LogScanner, block_windows};
use crate::store::EventStore;
use crate::sync::record_reconciliation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupplyTotals {
    pub minted: U256,
    pub burned: U256,
}

impl SupplyTotals {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TransferEvent>) -> Self {
        let mut totals = Self::default();
        for event in events {
            if event.is_mint() {
                totals.minted = totals.minted.saturating_add(event.quantity);
            }
            if event.is_burn() {
                totals.burned = totals.burned.saturating_add(event.quantity);
            }
        }
        totals
    }

    /// Net supply as (magnitude, negative). More burned than minted means
    /// events are missing; it is reported, never clamped.
    pub fn net(&self) -> (U256, bool) {
        self.burned.checked_sub(self.minted).map_or_else(
            || (self.minted.saturating_sub(self.burned), false),
            |deficit| (deficit, !deficit.is_zero()),
        )
    }
}

/// One validation window's verdict. `Unknown` means the upstream could not
/// be asked, which is neither a match nor a discrepancy.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WindowStatus {
    Matching {
        from_block: u64,
        to_block: u64,
        count: u64,
    },
    Discrepant {
        from_block: u64,
        to_block: u64,
        local_count: u64,
        authoritative_count: u64,
    },
    Unknown {
        from_block: u64,
        to_block: u64,
        reason: String,
    },
}

#[derive(Debug, Serialize)]
pub struct SupplyCheck {
    pub local_supply: String,
    pub authoritative_supply: String,
    /// Absolute difference between the two net supplies.
    pub discrepancy: String,
    /// Reporting-only figure; balances themselves never touch floats.
    pub accuracy_pct: f64,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub contract: String,
    pub from_block: u64,
    pub to_block: u64,
    pub windows: Vec<WindowStatus>,
    pub supply: Option<SupplyCheck>,
    pub supply_error: Option<String>,
}

impl ValidationReport {
    pub fn discrepant_windows(&self) -> Vec<(u64, u64)> {
        self.windows
            .iter()
            .filter_map(|window| match window {
                WindowStatus::Discrepant {
                    from_block,
                    to_block,
                    ..
                } => Some((*from_block, *to_block)),
                _ => None,
            })
            .collect()
    }

    pub fn unknown_count(&self) -> usize {
        self.windows
            .iter()
            .filter(|window| matches!(window, WindowStatus::Unknown { .. }))
            .count()
    }

    /// True when every window matched and the supply check found no
    /// difference.
    pub fn is_clean(&self) -> bool {
        self.windows
            .iter()
            .all(|window| matches!(window, WindowStatus::Matching { .. }))
            && self
                .supply
                .as_ref()
                .is_some_and(|supply| supply.discrepancy == "0")
    }
}

#[derive(Debug, Serialize)]
pub struct AutoFixReport {
    pub refilled_windows: usize,
    pub events_added: u64,
    pub duplicates_removed: u64,
    pub positions: usize,
    pub cleared: bool,
    pub revalidation: ValidationReport,
}

fn u256_to_f64_lossy(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::INFINITY)
}

fn signed_magnitude((magnitude, negative): (U256, bool), other: (U256, bool)) -> U256 {
    if negative == other.1 {
        magnitude.abs_diff(other.0)
    } else {
        magnitude.saturating_add(other.0)
    }
}

/// Builds the supply verdict from stored and authoritative totals.
pub fn supply_check(local: SupplyTotals, authoritative: SupplyTotals) -> SupplyCheck {
    let local_net = local.net();
    let authoritative_net = authoritative.net();
    let discrepancy = signed_magnitude(authoritative_net, local_net);

    let accuracy_pct = if authoritative_net.0.is_zero() {
        if discrepancy.is_zero() { 100.0 } else { 0.0 }
    } else {
        let ratio = u256_to_f64_lossy(discrepancy) / u256_to_f64_lossy(authoritative_net.0);
        ((1.0 - ratio) * 100.0).clamp(0.0, 100.0)
    };

    let render = |(magnitude, negative): (U256, bool)| {
        if negative {
            format!("-{magnitude}")
        } else {
            magnitude.to_string()
        }
    };

    SupplyCheck {
        local_supply: render(local_net),
        authoritative_supply: render(authoritative_net),
        discrepancy: discrepancy.to_string(),
        accuracy_pct,
    }
}

fn supply_from_logs(logs: &[Log]) -> SupplyTotals {
    let mut events = Vec::new();
    for log in logs {
        if let Ok(mut normalized) = event::normalize(log, 0) {
            events.append(&mut normalized);
        }
    }
    SupplyTotals::from_events(&events)
}

pub struct Reconciler<P> {
    pool: SqlitePool,
    store: EventStore,
    materializer: Materializer,
    scanner: LogScanner<P>,
    chain: ChainEnv,
}

impl<P: Provider + Clone> Reconciler<P> {
    pub fn new(pool: SqlitePool, scanner: LogScanner<P>, chain: ChainEnv) -> Self {
        let store = EventStore::new(pool.clone());
        let materializer = Materializer::new(pool.clone());
        Self {
            pool,
            store,
            materializer,
            scanner,
            chain,
        }
    }

    /// Compares stored counts and supply against the source over
    /// `[from, to]`. Upstream failures mark windows `Unknown` rather than
    /// guessing either way.
    pub async fn validate(&self, from: u64, to: u64) -> Result<ValidationReport, IndexerError> {
        let contract = self.chain.contract;
        let mut windows = Vec::new();

        for (window_from, window_to) in
            block_windows(from, to, self.scanner.config().reconcile_window_blocks)
        {
            let local_count = self
                .store
                .count_in_range(contract, window_from, window_to)
                .await?;

            match self
                .scanner
                .count_events(contract, window_from, window_to)
                .await
            {
                Ok(authoritative_count) if authoritative_count == local_count => {
                    windows.push(WindowStatus::Matching {
                        from_block: window_from,
                        to_block: window_to,
                        count: local_count,
                    });
                }
                Ok(authoritative_count) => {
                    warn!(
                        "window {window_from}-{window_to} discrepant: \
                         {local_count} stored vs {authoritative_count} on chain"
                    );
                    windows.push(WindowStatus::Discrepant {
                        from_block: window_from,
                        to_block: window_to,
                        local_count,
                        authoritative_count,
                    });
                }
                Err(error) => {
                    warn!("window {window_from}-{window_to} could not be validated: {error}");
                    windows.push(WindowStatus::Unknown {
                        from_block: window_from,
                        to_block: window_to,
                        reason: error.to_string(),
                    });
                }
            }
        }

        let local_supply =
            SupplyTotals::from_events(&self.store.supply_events(contract, from, to).await?);

        let (supply, supply_error) = match self.scanner.fetch_logs(contract, from, to).await {
            Ok(logs) => {
                let check = supply_check(local_supply, supply_from_logs(&logs));
                (Some(check), None)
            }
            Err(error) => {
                warn!("authoritative supply could not be computed: {error}");
                (None, Some(error.to_string()))
            }
        };

        Ok(ValidationReport {
            contract: event::canonical_address(&contract),
            from_block: from,
            to_block: to,
            windows,
            supply,
            supply_error,
        })
    }

    /// Backfills every discrepant window, sweeps exact duplicates, rebuilds
    /// the projection and validates once more. Existing correct events are
    /// never deleted.
    pub async fn auto_fix(&self, from: u64, to: u64) -> Result<AutoFixReport, IndexerError> {
        let contract = self.chain.contract;
        let validation = self.validate(from, to).await?;
        let discrepant = validation.discrepant_windows();

        let mut events_added = 0u64;
        let mut refilled_windows = 0usize;

        for (window_from, window_to) in &discrepant {
            match self
                .scanner
                .scan_window(contract, *window_from, *window_to)
                .await
            {
                Ok(scan) => {
                    let inserted = self.store.append(&scan.events).await?;
                    info!(
                        "refilled window {window_from}-{window_to}: {inserted} events recovered"
                    );
                    events_added += inserted;
                    refilled_windows += 1;
                }
                Err(error) => {
                    warn!("could not refill window {window_from}-{window_to}: {error}");
                }
            }
        }

        let duplicates_removed = self.store.remove_duplicates_keeping_one(contract).await?;
        let rebuild = self.materializer.rebuild_all(contract).await?;

        let revalidation = self.validate(from, to).await?;
        let cleared = revalidation.is_clean();

        let summary = serde_json::json!({
            "from_block": from,
            "to_block": to,
            "discrepant_windows": discrepant.len(),
            "unknown_windows": revalidation.unknown_count(),
            "events_added": events_added,
            "duplicates_removed": duplicates_removed,
            "accuracy_pct": revalidation.supply.as_ref().map(|supply| supply.accuracy_pct),
            "cleared": cleared,
            "checked_at": chrono::Utc::now().to_rfc3339(),
        });
        record_reconciliation(&self.pool, contract, &summary).await?;

        Ok(AutoFixReport {
            refilled_windows,
            events_added,
            duplicates_removed,
            positions: rebuild.positions,
            cleared,
            revalidation,
        })
    }
}
