use clap::{Parser, Subcommand};
use std::io::Write;
use tokio::sync::watch;
use tracing::info;

use crate::env::Env;
use crate::reconcile::{ValidationReport, WindowStatus};
use crate::sync::load_cursor;

#[derive(Debug, Parser)]
#[command(name = "holderscan")]
#[command(about = "Token transfer indexer with on-chain reconciliation")]
#[command(version)]
pub struct Cli {
    #[clap(flatten)]
    pub env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan the chain, store transfer events and materialize holder balances
    Sync {
        /// First block to scan; defaults to the cursor or deployment block
        #[arg(long)]
        from: Option<u64>,
        /// Last block to scan; defaults to the current chain head
        #[arg(long)]
        to: Option<u64>,
    },
    /// Compare stored events and supply against the chain without changing
    /// anything
    Validate {
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
    /// Backfill discrepant ranges, sweep duplicates and rebuild balances
    Autofix {
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
    /// Rebuild holder balances from the stored event log
    Rebuild,
    /// Serve the query API with a live sync pipeline
    Serve,
    /// Show the sync cursor and the last reconciliation summary
    Status,
}

pub async fn run_command(env: Env, command: Commands) -> anyhow::Result<()> {
    run_command_with_writers(env, command, &mut std::io::stdout()).await
}

async fn run_command_with_writers<W: Write>(
    env: Env,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<()> {
    if matches!(command, Commands::Serve) {
        return crate::launch(env).await;
    }

    let pool = env.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    match command {
        Commands::Sync { from, to } => {
            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested, stopping at the next window boundary");
                    let _ = cancel_tx.send(true);
                }
            });

            let report = crate::run_sync(&env, pool, from, to, cancel_rx).await?;

            writeln!(
                stdout,
                "synced blocks {}-{}: {} events added across {} windows",
                report.from_block, report.to_block, report.events_added, report.windows_scanned
            )?;
            if report.decode_failures > 0 {
                writeln!(stdout, "skipped {} undecodable logs", report.decode_failures)?;
            }
            for failed in &report.failed_windows {
                writeln!(
                    stdout,
                    "window {}-{} failed: {}",
                    failed.from_block, failed.to_block, failed.error
                )?;
            }
            writeln!(
                stdout,
                "holder positions: {} ({} anomalies), status: {}",
                report.positions,
                report.anomalies,
                if report.completed {
                    "completed"
                } else if report.cancelled {
                    "cancelled"
                } else {
                    "partial"
                }
            )?;
        }
        Commands::Validate { from, to } => {
            let report = crate::run_validate(&env, pool, from, to).await?;
            write_validation(stdout, &report)?;
        }
        Commands::Autofix { from, to } => {
            let report = crate::run_autofix(&env, pool, from, to).await?;
            writeln!(
                stdout,
                "refilled {} windows ({} events recovered), removed {} duplicates",
                report.refilled_windows, report.events_added, report.duplicates_removed
            )?;
            writeln!(
                stdout,
                "findings {} after re-validation",
                if report.cleared { "cleared" } else { "remain" }
            )?;
            write_validation(stdout, &report.revalidation)?;
        }
        Commands::Rebuild => {
            let summary = crate::run_rebuild(&env, pool).await?;
            writeln!(
                stdout,
                "rebuilt {} holder positions ({} anomalies)",
                summary.positions,
                summary.anomalies.len()
            )?;
            for anomaly in &summary.anomalies {
                writeln!(
                    stdout,
                    "negative balance for holder {} asset {}: short by {}",
                    anomaly.holder, anomaly.asset_id, anomaly.deficit
                )?;
            }
        }
        Commands::Status => {
            match load_cursor(&pool, env.chain.contract).await? {
                Some(cursor) => {
                    writeln!(
                        stdout,
                        "contract {}: status {}, last synced block {}",
                        cursor.contract,
                        cursor.status.as_str(),
                        cursor
                            .last_synced_block
                            .map_or_else(|| "none".to_string(), |block| block.to_string())
                    )?;
                    if let Some(error) = &cursor.error {
                        writeln!(stdout, "last error: {error}")?;
                    }
                    if let Some(reconciliation) = &cursor.last_reconciliation {
                        writeln!(stdout, "last reconciliation: {reconciliation}")?;
                    }
                }
                None => writeln!(stdout, "no sync has run for {}", env.chain.contract)?,
            }
        }
        Commands::Serve => unreachable!("handled above"),
    }

    Ok(())
}

fn write_validation<W: Write>(stdout: &mut W, report: &ValidationReport) -> anyhow::Result<()> {
    let discrepant = report.discrepant_windows();
    writeln!(
        stdout,
        "validated blocks {}-{}: {} windows checked, {} discrepant, {} unknown",
        report.from_block,
        report.to_block,
        report.windows.len(),
        discrepant.len(),
        report.unknown_count()
    )?;
    for window in &report.windows {
        match window {
            WindowStatus::Matching { .. } => {}
            WindowStatus::Discrepant {
                from_block,
                to_block,
                local_count,
                authoritative_count,
            } => writeln!(
                stdout,
                "  blocks {from_block}-{to_block}: {local_count} stored vs \
                 {authoritative_count} on chain"
            )?,
            WindowStatus::Unknown {
                from_block,
                to_block,
                reason,
            } => writeln!(stdout, "  blocks {from_block}-{to_block}: unknown ({reason})")?,
        }
    }
    match (&report.supply, &report.supply_error) {
        (Some(supply), _) => writeln!(
            stdout,
            "supply: {} stored vs {} on chain, off by {} ({:.2}% accurate)",
            supply.local_supply,
            supply.authoritative_supply,
            supply.discrepancy,
            supply.accuracy_pct
        )?,
        (None, Some(error)) => writeln!(stdout, "supply could not be verified: {error}")?,
        (None, None) => {}
    }
    Ok(())
}
