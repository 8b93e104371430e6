use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

use crate::store::errors::StoreError;
use crate::store::models::{
    AddressPoolEntry, Deposit, NewDeposit, NewOnChainEvent, OnChainEvent, ProcessedBlock,
    RollbackOutcome, RollbackReport,
};
use crate::store::types::{DbAddress, DbBlockNumber, DbHash, DbTimestamp};

/// Initialize the SQLite connection pool.
pub(crate) async fn init_pool(database_dsn: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_dsn)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Runs all schema migrations.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Newest cursor marker for `chain`.
pub(crate) async fn last_processed_block<'e, E>(
    executor: E,
    chain: &str,
) -> Result<Option<ProcessedBlock>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, ProcessedBlock>(
        r#"
        SELECT id, chain, block_number, block_hash, created_at
        FROM processed_blocks
        WHERE chain = ?1
        ORDER BY block_number DESC
        LIMIT 1
        "#,
    )
    .bind(chain)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

/// Up to `limit` cursor markers, newest first.
pub(crate) async fn recent_processed_blocks<'e, E>(
    executor: E,
    chain: &str,
    limit: u32,
) -> Result<Vec<ProcessedBlock>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, ProcessedBlock>(
        r#"
        SELECT id, chain, block_number, block_hash, created_at
        FROM processed_blocks
        WHERE chain = ?1
        ORDER BY block_number DESC
        LIMIT ?2
        "#,
    )
    .bind(chain)
    .bind(i64::from(limit))
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

pub(crate) async fn insert_processed_block<'e, E>(
    executor: E,
    chain: &str,
    block_number: DbBlockNumber,
    block_hash: &DbHash,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO processed_blocks (chain, block_number, block_hash, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(chain)
    .bind(block_number)
    .bind(block_hash)
    .bind(DbTimestamp::now())
    .execute(executor)
    .await?;

    Ok(())
}

/// Outcome of inserting a batch of scanned logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InsertSummary {
    pub(crate) inserted: usize,
    /// Rows already present from an earlier scan of the same range
    pub(crate) duplicates: usize,
}

/// Inserts events with `processed = false`, skipping ones already stored.
///
/// Runs on a single connection so callers can wrap it in a transaction.
pub(crate) async fn insert_events(
    conn: &mut SqliteConnection,
    events: &[NewOnChainEvent],
) -> Result<InsertSummary, StoreError> {
    let mut summary = InsertSummary::default();

    for event in events {
        let result = sqlx::query(
            r#"
            INSERT INTO on_chain_events
                (chain, block_number, block_hash, tx_hash, log_index, address, topics, data, processed, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
            "#,
        )
        .bind(&event.chain)
        .bind(event.block_number)
        .bind(&event.block_hash)
        .bind(&event.tx_hash)
        .bind(event.log_index)
        .bind(&event.address)
        .bind(&event.topics)
        .bind(&event.data)
        .bind(DbTimestamp::now())
        .execute(&mut *conn)
        .await
        .map_err(StoreError::from);

        match result {
            Ok(_) => summary.inserted += 1,
            Err(e) if e.is_unique_violation() => summary.duplicates += 1,
            Err(e) => return Err(e),
        }
    }

    Ok(summary)
}

/// Unprocessed events in `(block_number, id)` order.
pub(crate) async fn pending_events<'e, E>(
    executor: E,
    chain: &str,
    limit: u32,
) -> Result<Vec<OnChainEvent>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, OnChainEvent>(
        r#"
        SELECT id, chain, block_number, block_hash, tx_hash, log_index, address, topics, data, processed, created_at
        FROM on_chain_events
        WHERE chain = ?1 AND processed = 0
        ORDER BY block_number ASC, id ASC
        LIMIT ?2
        "#,
    )
    .bind(chain)
    .bind(i64::from(limit))
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

pub(crate) async fn event_by_id<'e, E>(
    executor: E,
    id: i64,
) -> Result<Option<OnChainEvent>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, OnChainEvent>(
        r#"
        SELECT id, chain, block_number, block_hash, tx_hash, log_index, address, topics, data, processed, created_at
        FROM on_chain_events
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

/// Flips `processed` false -> true. Returns the number of rows changed (0 or 1).
pub(crate) async fn mark_event_processed<'e, E>(executor: E, id: i64) -> Result<u64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE on_chain_events SET processed = 1 WHERE id = ?1 AND processed = 0")
        .bind(id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

pub(crate) async fn find_pool_address<'e, E>(
    executor: E,
    chain: &str,
    address: &DbAddress,
) -> Result<Option<AddressPoolEntry>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, AddressPoolEntry>(
        r#"
        SELECT id, chain, address, user_id, used
        FROM address_pool
        WHERE chain = ?1 AND lower(address) = ?2
        "#,
    )
    .bind(chain)
    .bind(address)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

/// Marks a pool address as used. Never flips it back.
pub(crate) async fn mark_address_used<'e, E>(executor: E, id: i64) -> Result<u64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE address_pool SET used = 1 WHERE id = ?1 AND used = 0")
        .bind(id)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

pub(crate) async fn deposit_exists<'e, E>(
    executor: E,
    chain: &str,
    tx_hash: &DbHash,
    log_index: i64,
) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let found: i64 = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM deposits WHERE chain = ?1 AND tx_hash = ?2 AND log_index = ?3
        )
        "#,
    )
    .bind(chain)
    .bind(tx_hash)
    .bind(log_index)
    .fetch_one(executor)
    .await?;

    Ok(found != 0)
}

/// Inserts a deposit and returns its id.
///
/// A second deposit for the same `(chain, tx_hash, log_index)` fails with
/// [`StoreError::UniqueViolation`].
pub(crate) async fn insert_deposit<'e, E>(
    executor: E,
    deposit: &NewDeposit,
) -> Result<i64, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO deposits
            (chain, token, to_address, user_id, amount, tx_hash, log_index, block_number, confirmed, released, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)
        "#,
    )
    .bind(&deposit.chain)
    .bind(&deposit.token)
    .bind(&deposit.to_address)
    .bind(deposit.user_id)
    .bind(&deposit.amount)
    .bind(&deposit.tx_hash)
    .bind(deposit.log_index)
    .bind(deposit.block_number)
    .bind(deposit.confirmed)
    .bind(DbTimestamp::now())
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Deposits sourced from events above `pivot`: matched through the source
/// event, or by their own block number once the event is gone.
async fn deposits_above(
    conn: &mut SqliteConnection,
    chain: &str,
    pivot: DbBlockNumber,
    released: bool,
) -> Result<Vec<Deposit>, StoreError> {
    let rows = sqlx::query_as::<_, Deposit>(
        r#"
        SELECT id, chain, token, to_address, user_id, amount, tx_hash, log_index,
               block_number, confirmed, released, created_at
        FROM deposits
        WHERE chain = ?1
          AND released = ?3
          AND (
            block_number > ?2
            OR EXISTS (
                SELECT 1 FROM on_chain_events e
                WHERE e.chain = deposits.chain
                  AND e.tx_hash = deposits.tx_hash
                  AND e.log_index = deposits.log_index
                  AND e.block_number > ?2
            )
          )
        ORDER BY block_number ASC, id ASC
        "#,
    )
    .bind(chain)
    .bind(pivot)
    .bind(released)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows)
}

/// Rewinds all state above `pivot` in one transaction.
///
/// Cursor markers and events above the pivot are deleted together with the
/// deposits they produced. If any of those deposits was already released,
/// nothing is changed and the conflicting deposits are returned instead.
pub(crate) async fn rollback_to(
    pool: &SqlitePool,
    chain: &str,
    pivot: DbBlockNumber,
) -> Result<RollbackOutcome, StoreError> {
    let mut tx = pool.begin().await?;

    let released = deposits_above(&mut *tx, chain, pivot, true).await?;
    if !released.is_empty() {
        tx.rollback().await?;
        return Ok(RollbackOutcome::Conflict(released));
    }

    let reverted_deposits = deposits_above(&mut *tx, chain, pivot, false).await?;
    for deposit in &reverted_deposits {
        sqlx::query("DELETE FROM deposits WHERE id = ?1")
            .bind(deposit.id)
            .execute(&mut *tx)
            .await?;
    }

    let events_deleted =
        sqlx::query("DELETE FROM on_chain_events WHERE chain = ?1 AND block_number > ?2")
            .bind(chain)
            .bind(pivot)
            .execute(&mut *tx)
            .await?
            .rows_affected();

    let blocks_deleted =
        sqlx::query("DELETE FROM processed_blocks WHERE chain = ?1 AND block_number > ?2")
            .bind(chain)
            .bind(pivot)
            .execute(&mut *tx)
            .await?
            .rows_affected();

    tx.commit().await?;

    Ok(RollbackOutcome::Applied(RollbackReport {
        blocks_deleted,
        events_deleted,
        reverted_deposits,
    }))
}

/// Persists one marker per released deposit that blocked a rollback.
pub(crate) async fn record_rollback_conflicts(
    pool: &SqlitePool,
    chain: &str,
    pivot: DbBlockNumber,
    deposits: &[Deposit],
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for deposit in deposits {
        sqlx::query(
            r#"
            INSERT INTO rollback_conflicts (chain, pivot, deposit_id, tx_hash, log_index, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(chain)
        .bind(pivot)
        .bind(deposit.id)
        .bind(&deposit.tx_hash)
        .bind(deposit.log_index)
        .bind(DbTimestamp::now())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
