use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::client::ChainClient;
use crate::chain::errors::RpcError;
use crate::config::ScannerSettings;
use crate::scanner::errors::ScanError;
use crate::scanner::reorg::{check_reorg, ReorgCheck};
use crate::scanner::step::{StepChange, StepController};
use crate::store::db::{insert_events, insert_processed_block, last_processed_block, InsertSummary};
use crate::store::errors::StoreError;
use crate::store::models::NewOnChainEvent;
use crate::store::types::{DbBlockNumber, DbHash};
use crate::utils::retry::execute_with_retries;

/// Result of one scanner tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Nothing new below the safe block.
    Idle,
    Scanned {
        start: u64,
        end: u64,
        logs: usize,
        /// Whether a cursor marker for `end` was written
        marker: bool,
    },
    /// An RPC call failed or the chain moved mid-tick. Retried next tick.
    Failed,
    /// A pending reorg check could not reach the node; no range was scanned.
    Deferred,
}

/// Walks the chain from the last cursor marker up to the safe block, one
/// adaptive range per tick, persisting every log as an unprocessed event.
pub(crate) struct Scanner<C: ChainClient> {
    client: Arc<C>,
    pool: SqlitePool,
    settings: ScannerSettings,
    step: StepController,
    ticks: u64,
    consecutive_failures: u32,
    /// Set at startup and whenever a re-check is scheduled.
    reorg_check_pending: bool,
}

impl<C: ChainClient> Scanner<C> {
    pub(crate) fn new(client: Arc<C>, pool: SqlitePool, settings: ScannerSettings) -> Self {
        let step = StepController::new(settings.step);
        Self {
            client,
            pool,
            settings,
            step,
            ticks: 0,
            consecutive_failures: 0,
            reorg_check_pending: true,
        }
    }

    /// Current range width.
    pub(crate) fn step(&self) -> u64 {
        self.step.step()
    }

    pub(crate) async fn check_reorg(&self) -> Result<ReorgCheck, ScanError> {
        check_reorg(
            &self.pool,
            self.client.as_ref(),
            &self.settings.chain,
            self.settings.reorg_check_depth,
        )
        .await
    }

    /// Ticks every `poll_interval` until `cancel` fires or a fatal error occurs.
    /// A tick interrupted by cancellation rolls back its open transaction.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<(), ScanError> {
        info!(
            chain = %self.settings.chain,
            confirmations = self.settings.confirmations,
            step = self.step(),
            "Scanner started"
        );

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.run_once() => { result?; }
            }
        }

        info!(chain = %self.settings.chain, "Scanner stopped");
        Ok(())
    }

    /// Runs a pending reorg check, then one tick, then schedules the next
    /// re-check if one is due.
    pub(crate) async fn run_once(&mut self) -> Result<TickOutcome, ScanError> {
        if self.reorg_check_pending {
            match self.check_reorg().await {
                Ok(_) => self.reorg_check_pending = false,
                Err(e) if !e.is_fatal() => {
                    warn!(chain = %self.settings.chain, error = %e, "Reorg check failed, retrying next tick");
                    return Ok(TickOutcome::Deferred);
                }
                Err(e) => return Err(e),
            }
        }

        let outcome = self.tick().await?;
        self.ticks += 1;

        let recheck = self.settings.reorg_recheck_ticks;
        if recheck > 0 && self.ticks % recheck == 0 {
            self.reorg_check_pending = true;
        }
        let max_failures = self.settings.max_consecutive_failures;
        if max_failures > 0 && self.consecutive_failures >= max_failures {
            warn!(
                chain = %self.settings.chain,
                consecutive_failures = self.consecutive_failures,
                "Repeated scan failures, scheduling reorg check"
            );
            self.reorg_check_pending = true;
            self.consecutive_failures = 0;
        }

        Ok(outcome)
    }

    /// Scans the next range. RPC trouble is absorbed into the step controller;
    /// only store errors are returned.
    pub(crate) async fn tick(&mut self) -> Result<TickOutcome, ScanError> {
        let chain = self.settings.chain.as_str();

        let head = match self.client.latest_head().await {
            Ok(head) => head,
            Err(e) => return Ok(self.rpc_failure("latest_head", e)),
        };
        let confirmations = self.settings.confirmations;
        if head.number <= confirmations {
            debug!(chain, head = head.number, confirmations, "Chain shorter than confirmation depth");
            return Ok(TickOutcome::Idle);
        }
        let safe = head.number - confirmations;

        let last = execute_with_retries(
            || last_processed_block(&self.pool, chain),
            "last_processed_block",
        )
        .await?
        .map(|block| u64::from(block.block_number))
        .unwrap_or(0);
        let start = last + 1;
        if start > safe {
            debug!(chain, last, safe, "Caught up with safe block");
            return Ok(TickOutcome::Idle);
        }
        let step = self.step.step();
        let end = start.saturating_add(step - 1).min(safe);

        let logs = match self.client.logs(start, end, &self.settings.log_filter).await {
            Ok(logs) => logs,
            Err(e) => return Ok(self.rpc_failure("eth_getLogs", e)),
        };
        let fetched = logs.len();
        let logs: Vec<_> = logs.into_iter().filter(|log| !log.removed).collect();
        if logs.len() < fetched {
            debug!(chain, start, end, removed = fetched - logs.len(), "Ignoring removed logs");
        }

        let header = match self.client.header_at(end).await {
            Ok(Some(header)) => Some(header),
            Ok(None) => {
                warn!(chain, block_number = end, "Header unavailable, committing range without cursor marker");
                None
            }
            Err(e) => {
                warn!(chain, block_number = end, error = %e, "Header fetch failed, committing range without cursor marker");
                None
            }
        };

        if let Some(header) = &header {
            let moved = logs
                .iter()
                .find(|log| log.block_number == end && log.block_hash != header.hash);
            if let Some(log) = moved {
                warn!(
                    chain,
                    block_number = end,
                    log_block_hash = %DbHash::from(log.block_hash),
                    header_hash = %DbHash::from(header.hash),
                    "Chain moved during scan, retrying range"
                );
                let change = self.step.on_failure();
                return Ok(self.note_failure(change));
            }
        }

        let events = logs
            .iter()
            .map(|log| NewOnChainEvent::from_log(chain, log))
            .collect::<Result<Vec<_>, _>>()?;
        let end_number = DbBlockNumber::try_from(end)?;
        let end_hash = header.map(|header| DbHash::from(header.hash));

        let summary = execute_with_retries(
            || commit_range(&self.pool, chain, &events, end_number, end_hash.as_ref()),
            "commit_range",
        )
        .await?;

        self.consecutive_failures = 0;
        info!(
            chain,
            start,
            end,
            safe,
            step,
            logs_count = events.len(),
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            "Scanned range"
        );
        log_step_change(chain, self.step.on_success());

        Ok(TickOutcome::Scanned {
            start,
            end,
            logs: events.len(),
            marker: end_hash.is_some(),
        })
    }

    fn rpc_failure(&mut self, operation: &str, err: RpcError) -> TickOutcome {
        let change = if err.is_permanent() {
            warn!(
                chain = %self.settings.chain,
                operation,
                error = %err,
                step = self.step(),
                "Permanent RPC failure, capping range width"
            );
            self.step.on_permanent_failure()
        } else {
            warn!(
                chain = %self.settings.chain,
                operation,
                error = %err,
                step = self.step(),
                "RPC failure, retrying next tick"
            );
            self.step.on_failure()
        };
        self.note_failure(change)
    }

    fn note_failure(&mut self, change: Option<StepChange>) -> TickOutcome {
        self.consecutive_failures += 1;
        log_step_change(&self.settings.chain, change);
        TickOutcome::Failed
    }
}

fn log_step_change(chain: &str, change: Option<StepChange>) {
    if let Some(StepChange { from, to }) = change {
        info!(chain, from, to, "Step changed");
    }
}

/// Persists the events of a range and, when its hash is known, the cursor
/// marker for its last block, in one transaction.
async fn commit_range(
    pool: &SqlitePool,
    chain: &str,
    events: &[NewOnChainEvent],
    end: DbBlockNumber,
    end_hash: Option<&DbHash>,
) -> Result<InsertSummary, StoreError> {
    let mut tx = pool.begin().await?;
    let summary = insert_events(&mut *tx, events).await?;

    if let Some(hash) = end_hash {
        match insert_processed_block(&mut *tx, chain, end, hash).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                warn!(chain, block_number = %end, "Cursor marker already stored");
            }
            Err(e) => return Err(e),
        }
    }

    tx.commit().await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::step::StepBounds;
    use crate::testing::{self, addr, memory_pool, MockChain};
    use alloy_primitives::Bytes;
    use std::time::Duration;

    fn settings(initial_step: u64) -> ScannerSettings {
        ScannerSettings {
            confirmations: 2,
            step: StepBounds {
                initial_step,
                min_step: 1,
                max_step: 1_000,
                ..StepBounds::default()
            },
            poll_interval: Duration::from_millis(10),
            ..ScannerSettings::default()
        }
    }

    async fn scanner(chain: &Arc<MockChain>, initial_step: u64) -> Scanner<MockChain> {
        Scanner::new(Arc::clone(chain), memory_pool().await, settings(initial_step))
    }

    #[tokio::test]
    async fn idle_below_confirmation_depth() {
        let chain = Arc::new(MockChain::new(2));
        let mut scanner = scanner(&chain, 10).await;

        assert_eq!(scanner.tick().await.unwrap(), TickOutcome::Idle);
        assert!(chain.logs_calls().is_empty());
    }

    #[tokio::test]
    async fn scans_up_to_safe_block() {
        let chain = Arc::new(MockChain::new(17));
        chain.push_transfer(4, addr(0xc0), addr(1), addr(2), 10);
        chain.push_transfer(12, addr(0xc0), addr(1), addr(2), 20);
        let mut scanner = scanner(&chain, 10).await;

        let first = scanner.tick().await.unwrap();
        assert_eq!(first, TickOutcome::Scanned { start: 1, end: 10, logs: 1, marker: true });
        let second = scanner.tick().await.unwrap();
        assert_eq!(second, TickOutcome::Scanned { start: 11, end: 15, logs: 1, marker: true });
        assert_eq!(scanner.tick().await.unwrap(), TickOutcome::Idle);

        assert_eq!(testing::processed_block_numbers(&scanner.pool).await, vec![10, 15]);
        let events = testing::events(&scanner.pool).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| !e.processed));
    }

    #[tokio::test]
    async fn missing_header_commits_events_without_marker() {
        let chain = Arc::new(MockChain::new(12));
        chain.push_transfer(5, addr(0xc0), addr(1), addr(2), 10);
        chain.hide_header(10);
        let mut scanner = scanner(&chain, 10).await;

        let outcome = scanner.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Scanned { start: 1, end: 10, logs: 1, marker: false });
        assert!(testing::processed_block_numbers(&scanner.pool).await.is_empty());

        chain.show_header(10);
        scanner.tick().await.unwrap();
        assert_eq!(chain.logs_calls(), vec![(1, 10), (1, 10)]);
        assert_eq!(testing::processed_block_numbers(&scanner.pool).await, vec![10]);
        assert_eq!(testing::events(&scanner.pool).await.len(), 1);
    }

    #[tokio::test]
    async fn header_error_commits_events_without_marker() {
        let chain = Arc::new(MockChain::new(12));
        chain.push_transfer(5, addr(0xc0), addr(1), addr(2), 10);
        chain.fail_header(1);
        let mut scanner = scanner(&chain, 10).await;

        let outcome = scanner.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Scanned { start: 1, end: 10, logs: 1, marker: false });
        assert_eq!(scanner.consecutive_failures, 0);
        assert!(testing::processed_block_numbers(&scanner.pool).await.is_empty());
        assert_eq!(testing::events(&scanner.pool).await.len(), 1);
    }

    #[tokio::test]
    async fn rpc_failure_narrows_step_and_writes_nothing() {
        let chain = Arc::new(MockChain::new(500));
        chain.fail_logs(1);
        let mut scanner = scanner(&chain, 200).await;

        assert_eq!(scanner.tick().await.unwrap(), TickOutcome::Failed);
        assert_eq!(scanner.step(), 100);
        assert!(testing::processed_block_numbers(&scanner.pool).await.is_empty());

        chain.fail_head(1);
        assert_eq!(scanner.tick().await.unwrap(), TickOutcome::Failed);
        assert_eq!(scanner.step(), 50);

        let outcome = scanner.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Scanned { start: 1, end: 50, logs: 0, marker: true });
    }

    #[tokio::test]
    async fn chain_moving_under_scan_is_a_failure() {
        let chain = Arc::new(MockChain::new(12));
        chain.push_transfer(10, addr(0xc0), addr(1), addr(2), 10);
        chain.rehash_block(10);
        let mut scanner = scanner(&chain, 10).await;

        assert_eq!(scanner.tick().await.unwrap(), TickOutcome::Failed);
        assert!(testing::events(&scanner.pool).await.is_empty());
        assert!(testing::processed_block_numbers(&scanner.pool).await.is_empty());
    }

    #[tokio::test]
    async fn removed_logs_are_ignored() {
        let chain = Arc::new(MockChain::new(12));
        chain.push_transfer(3, addr(0xc0), addr(1), addr(2), 10);
        chain.push_log(3, addr(0xc0), vec![], Bytes::new());
        chain.remove_log(3, 0);
        let mut scanner = scanner(&chain, 10).await;

        let outcome = scanner.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Scanned { start: 1, end: 10, logs: 1, marker: true });
        assert_eq!(testing::events(&scanner.pool).await[0].log_index, 1);
    }

    #[tokio::test]
    async fn periodic_recheck_rolls_back_reorged_blocks() {
        let chain = Arc::new(MockChain::new(12));
        let pool = memory_pool().await;
        let settings = ScannerSettings {
            reorg_recheck_ticks: 2,
            ..settings(5)
        };
        let mut scanner = Scanner::new(Arc::clone(&chain), pool.clone(), settings);

        scanner.run_once().await.unwrap();
        scanner.run_once().await.unwrap();
        assert_eq!(testing::processed_block_numbers(&pool).await, vec![5, 10]);

        chain.reorg_from(8);
        let outcome = scanner.run_once().await.unwrap();
        assert_eq!(outcome, TickOutcome::Scanned { start: 6, end: 10, logs: 0, marker: true });
        assert_eq!(testing::processed_block_numbers(&pool).await, vec![5, 10]);
        let marker: String =
            sqlx::query_scalar("SELECT block_hash FROM processed_blocks WHERE block_number = 10")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(marker, format!("{:#x}", chain.hash_of(10)));
    }

    #[tokio::test]
    async fn unreachable_node_defers_reorg_check() {
        let chain = Arc::new(MockChain::new(12));
        let pool = memory_pool().await;
        let mut scanner = Scanner::new(Arc::clone(&chain), pool.clone(), settings(5));
        scanner.run_once().await.unwrap();
        scanner.run_once().await.unwrap();
        assert_eq!(testing::processed_block_numbers(&pool).await, vec![5, 10]);

        chain.reorg_from(8);
        chain.fail_header(1);
        scanner.reorg_check_pending = true;
        assert_eq!(scanner.run_once().await.unwrap(), TickOutcome::Deferred);
        assert!(scanner.reorg_check_pending);
        assert_eq!(chain.logs_calls().len(), 2);
        assert_eq!(testing::processed_block_numbers(&pool).await, vec![5, 10]);

        let outcome = scanner.run_once().await.unwrap();
        assert_eq!(outcome, TickOutcome::Scanned { start: 6, end: 10, logs: 0, marker: true });
        assert!(!scanner.reorg_check_pending);
    }

    #[tokio::test]
    async fn repeated_failures_schedule_reorg_check() {
        let chain = Arc::new(MockChain::new(12));
        let settings = ScannerSettings {
            max_consecutive_failures: 2,
            reorg_recheck_ticks: 0,
            ..settings(5)
        };
        let mut scanner = Scanner::new(Arc::clone(&chain), memory_pool().await, settings);
        scanner.run_once().await.unwrap();
        assert!(!scanner.reorg_check_pending);

        chain.fail_logs(2);
        scanner.run_once().await.unwrap();
        assert!(!scanner.reorg_check_pending);
        scanner.run_once().await.unwrap();
        assert!(scanner.reorg_check_pending);
    }

    #[tokio::test]
    async fn run_returns_when_cancelled() {
        let chain = Arc::new(MockChain::new(12));
        let scanner = scanner(&chain, 10).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), scanner.run(cancel))
            .await
            .unwrap()
            .unwrap();
    }
}
