use futures::{stream, StreamExt, TryStreamExt};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ProcessorSettings;
use crate::processor::decoder::{decode_event, Transfer};
use crate::store::db::{
    deposit_exists, event_by_id, find_pool_address, insert_deposit, mark_address_used,
    mark_event_processed, pending_events,
};
use crate::store::errors::StoreError;
use crate::store::models::{NewDeposit, OnChainEvent};
use crate::store::types::{DbAddress, DbAmount};
use crate::utils::retry::execute_with_retries;

/// What `process_one` did with an event.
#[derive(Debug, Clone)]
pub(crate) enum ProcessOutcome {
    Credited { deposit_id: i64, deposit: NewDeposit },
    /// Not an ERC-20 transfer; marked processed.
    NotATransfer,
    /// Destination is not a managed address; marked processed.
    PoolMiss,
    /// A deposit for this log already exists; marked processed.
    Duplicate,
    /// Another worker processed the event first. Nothing was written.
    AlreadyHandled,
}

/// Per-batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BatchSummary {
    pub(crate) fetched: usize,
    pub(crate) credited: usize,
    pub(crate) skipped: usize,
    pub(crate) duplicates: usize,
    pub(crate) already_handled: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Credited { .. } => self.credited += 1,
            ProcessOutcome::NotATransfer | ProcessOutcome::PoolMiss => self.skipped += 1,
            ProcessOutcome::Duplicate => self.duplicates += 1,
            ProcessOutcome::AlreadyHandled => self.already_handled += 1,
        }
    }
}

/// Turns unprocessed events into deposits for managed addresses.
#[derive(Debug, Clone)]
pub(crate) struct Processor {
    pool: SqlitePool,
    settings: ProcessorSettings,
}

impl Processor {
    pub(crate) fn new(pool: SqlitePool, settings: ProcessorSettings) -> Self {
        Self { pool, settings }
    }

    /// Ticks every `poll_interval` until `cancel` fires or a store error
    /// survives its retry.
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<(), StoreError> {
        info!(
            chain = %self.settings.chain,
            batch_size = self.settings.batch_size,
            workers = self.settings.workers,
            "Processor started"
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
                result = self.tick() => { result?; }
            }
        }

        info!(chain = %self.settings.chain, "Processor stopped");
        Ok(())
    }

    /// Processes one batch of pending events, `workers` at a time.
    pub(crate) async fn tick(&self) -> Result<BatchSummary, StoreError> {
        let chain = self.settings.chain.as_str();
        let events = execute_with_retries(
            || pending_events(&self.pool, chain, self.settings.batch_size),
            "pending_events",
        )
        .await?;
        if events.is_empty() {
            return Ok(BatchSummary::default());
        }

        let ids: Vec<i64> = events.iter().map(|event| event.id).collect();
        let outcomes: Vec<ProcessOutcome> = stream::iter(ids)
            .map(|event_id| {
                let pool = &self.pool;
                async move {
                    execute_with_retries(|| process_one(pool, event_id), "process_one").await
                }
            })
            .buffered(self.settings.workers.max(1))
            .try_collect()
            .await?;

        let mut summary = BatchSummary {
            fetched: events.len(),
            ..BatchSummary::default()
        };
        for outcome in &outcomes {
            summary.record(outcome);
        }

        info!(
            chain,
            fetched = summary.fetched,
            credited = summary.credited,
            skipped = summary.skipped,
            duplicates = summary.duplicates,
            already_handled = summary.already_handled,
            "Processed batch"
        );
        Ok(summary)
    }
}

/// Handles a single event in its own transaction.
///
/// The event is claimed with the conditional `processed` update before
/// anything is read, so the transaction holds the write lock from its first
/// statement and concurrent workers never credit the same log twice. Any
/// error rolls the transaction back and leaves the event pending.
pub(crate) async fn process_one(pool: &SqlitePool, event_id: i64) -> Result<ProcessOutcome, StoreError> {
    let mut tx = pool.begin().await?;

    if mark_event_processed(&mut *tx, event_id).await? == 0 {
        tx.rollback().await?;
        return Ok(ProcessOutcome::AlreadyHandled);
    }
    let Some(event) = event_by_id(&mut *tx, event_id).await? else {
        tx.rollback().await?;
        return Ok(ProcessOutcome::AlreadyHandled);
    };

    let outcome = match decode_event(&event) {
        Ok(transfer) => credit(&mut *tx, &event, &transfer).await?,
        Err(reason) => {
            debug!(
                event_id,
                tx_hash = %event.tx_hash,
                log_index = event.log_index,
                %reason,
                "Skipping event that is not a transfer"
            );
            ProcessOutcome::NotATransfer
        }
    };

    tx.commit().await?;

    if let ProcessOutcome::Credited { deposit_id, deposit } = &outcome {
        info!(
            chain = %deposit.chain,
            deposit_id,
            tx_hash = %deposit.tx_hash,
            log_index = deposit.log_index,
            to_address = %deposit.to_address,
            user_id = ?deposit.user_id,
            amount = %deposit.amount,
            block_number = %deposit.block_number,
            "Deposit credited"
        );
    }
    Ok(outcome)
}

async fn credit(
    conn: &mut SqliteConnection,
    event: &OnChainEvent,
    transfer: &Transfer,
) -> Result<ProcessOutcome, StoreError> {
    let to_address = DbAddress::from(transfer.to);
    let Some(entry) = find_pool_address(&mut *conn, &event.chain, &to_address).await? else {
        debug!(event_id = event.id, to_address = %to_address, "Destination is not a managed address");
        return Ok(ProcessOutcome::PoolMiss);
    };

    if deposit_exists(&mut *conn, &event.chain, &event.tx_hash, event.log_index).await? {
        debug!(event_id = event.id, tx_hash = %event.tx_hash, "Deposit already recorded");
        return Ok(ProcessOutcome::Duplicate);
    }

    let deposit = NewDeposit {
        chain: event.chain.clone(),
        token: Some(event.address.clone()),
        to_address,
        user_id: entry.user_id,
        amount: DbAmount::from(transfer.value),
        tx_hash: event.tx_hash.clone(),
        log_index: event.log_index,
        block_number: event.block_number,
        confirmed: true,
    };
    let deposit_id = match insert_deposit(&mut *conn, &deposit).await {
        Ok(id) => id,
        Err(e) if e.is_unique_violation() => return Ok(ProcessOutcome::Duplicate),
        Err(e) => return Err(e),
    };

    if !entry.used {
        mark_address_used(&mut *conn, entry.id).await?;
    }

    Ok(ProcessOutcome::Credited { deposit_id, deposit })
}
