//! Startup (and periodic) verification of stored cursor markers against the
//! canonical chain.

use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::chain::client::ChainClient;
use crate::scanner::errors::ScanError;
use crate::store::db::{recent_processed_blocks, record_rollback_conflicts, rollback_to};
use crate::store::models::{RollbackOutcome, RollbackReport};
use crate::store::types::{DbBlockNumber, DbHash};
use crate::utils::retry::execute_with_retries;

#[derive(Debug)]
pub(crate) enum ReorgCheck {
    /// The newest verifiable marker is canonical. `None` when no marker could
    /// be verified (empty store, or every header unavailable).
    Consistent { verified: Option<u64> },
    /// State above `pivot` was discarded and will be re-scanned.
    RolledBack { pivot: u64, report: RollbackReport },
}

/// Compares the newest `depth` cursor markers of `chain` with the node's
/// headers, newest first, and rewinds the store if the chain moved.
///
/// The pivot is the newest marker whose hash is still canonical. Markers the
/// node cannot resolve are skipped. A transient RPC error aborts the check
/// without touching the store.
pub(crate) async fn check_reorg<C>(
    pool: &SqlitePool,
    client: &C,
    chain: &str,
    depth: u32,
) -> Result<ReorgCheck, ScanError>
where
    C: ChainClient + ?Sized,
{
    let markers = recent_processed_blocks(pool, chain, depth).await?;
    let Some(oldest) = markers.last().map(|m| u64::from(m.block_number)) else {
        debug!(chain, "No cursor markers to verify");
        return Ok(ReorgCheck::Consistent { verified: None });
    };

    let mut mismatches = 0usize;
    let mut verified = None;
    for marker in &markers {
        let block_number = u64::from(marker.block_number);
        let Some(header) = client.header_at(block_number).await? else {
            debug!(chain, block_number, "Header unavailable, skipping marker");
            continue;
        };

        let chain_hash = DbHash::from(header.hash);
        if chain_hash == marker.block_hash {
            verified = Some(block_number);
            break;
        }

        mismatches += 1;
        warn!(
            chain,
            block_number,
            db_hash = %marker.block_hash,
            chain_hash = %chain_hash,
            "Reorg detected"
        );
    }

    match (verified, mismatches) {
        (verified, 0) => {
            if verified.is_none() {
                warn!(
                    chain,
                    checked = markers.len(),
                    "No cursor marker could be verified, assuming state is consistent"
                );
            }
            Ok(ReorgCheck::Consistent { verified })
        }
        (Some(pivot), _) => {
            let report = rollback(pool, chain, pivot).await?;
            Ok(ReorgCheck::RolledBack { pivot, report })
        }
        (None, _) if markers.len() < depth as usize => {
            // Every stored marker was checked, so no canonical state is known.
            info!(chain, checked = markers.len(), "No stored marker is canonical, rewinding to genesis");
            let report = rollback(pool, chain, 0).await?;
            Ok(ReorgCheck::RolledBack { pivot: 0, report })
        }
        (None, _) => {
            let pivot = oldest.saturating_sub(1);
            error!(
                chain,
                depth,
                pivot,
                "Reorg is deeper than the checked window, operator intervention required"
            );
            rollback(pool, chain, pivot).await?;
            Err(ScanError::DeepReorg { depth, pivot })
        }
    }
}

async fn rollback(pool: &SqlitePool, chain: &str, pivot: u64) -> Result<RollbackReport, ScanError> {
    let pivot_number = DbBlockNumber::try_from(pivot)?;
    let outcome =
        execute_with_retries(|| rollback_to(pool, chain, pivot_number), "rollback_to").await?;

    match outcome {
        RollbackOutcome::Applied(report) => {
            for deposit in &report.reverted_deposits {
                warn!(
                    chain,
                    deposit_id = deposit.id,
                    tx_hash = %deposit.tx_hash,
                    log_index = deposit.log_index,
                    to_address = %deposit.to_address,
                    user_id = ?deposit.user_id,
                    amount = %deposit.amount,
                    "Deposit reverted by reorg"
                );
            }
            info!(
                chain,
                pivot,
                blocks_deleted = report.blocks_deleted,
                events_deleted = report.events_deleted,
                deposits_reverted = report.reverted_deposits.len(),
                "Rolled back to pivot"
            );
            Ok(report)
        }
        RollbackOutcome::Conflict(released) => {
            for deposit in &released {
                error!(
                    chain,
                    pivot,
                    deposit_id = deposit.id,
                    tx_hash = %deposit.tx_hash,
                    log_index = deposit.log_index,
                    user_id = ?deposit.user_id,
                    amount = %deposit.amount,
                    "Released deposit sits above the reorg pivot"
                );
            }
            execute_with_retries(
                || record_rollback_conflicts(pool, chain, pivot_number, &released),
                "record_rollback_conflicts",
            )
            .await?;
            Err(ScanError::RollbackConflict {
                pivot,
                deposits: released.len(),
            })
        }
    }
}
