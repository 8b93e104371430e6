//! Test doubles shared by unit and end-to-end tests: an in-memory store and a
//! scriptable chain.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;

use crate::chain::client::ChainClient;
use crate::chain::errors::RpcError;
use crate::chain::types::{BlockHeader, LogEntry, LogFilter};
use crate::processor::decoder::TRANSFER_EVENT_SIG;
use crate::store::db::{insert_events, run_migrations};
use crate::store::models::{AddressPoolEntry, Deposit, NewOnChainEvent, OnChainEvent};

pub(crate) const CHAIN: &str = "ethereum";

/// Single-connection in-memory database with the schema applied.
///
/// Every query of a test shares the one connection, so code under test must
/// never hold a transaction while querying through the pool.
pub(crate) async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Stands in for the address generation service.
pub(crate) async fn add_pool_address(pool: &SqlitePool, address: &str, user_id: Option<i64>) -> i64 {
    sqlx::query("INSERT INTO address_pool (chain, address, user_id, used) VALUES (?1, ?2, ?3, 0)")
        .bind(CHAIN)
        .bind(address)
        .bind(user_id)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

pub(crate) async fn pool_entry(pool: &SqlitePool, address: &Address) -> AddressPoolEntry {
    sqlx::query_as("SELECT id, chain, address, user_id, used FROM address_pool WHERE address = ?1")
        .bind(format!("{address:#x}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Persists logs as unprocessed events, the way the scanner does.
pub(crate) async fn store_logs(pool: &SqlitePool, logs: &[LogEntry]) {
    let events: Vec<NewOnChainEvent> = logs
        .iter()
        .map(|log| NewOnChainEvent::from_log(CHAIN, log).unwrap())
        .collect();
    let mut conn = pool.acquire().await.unwrap();
    insert_events(&mut conn, &events).await.unwrap();
}

/// Stands in for the balance service releasing a credit.
pub(crate) async fn release_deposit(pool: &SqlitePool, id: i64) {
    sqlx::query("UPDATE deposits SET released = 1 WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

pub(crate) async fn deposits(pool: &SqlitePool) -> Vec<Deposit> {
    sqlx::query_as(
        r#"
        SELECT id, chain, token, to_address, user_id, amount, tx_hash, log_index,
               block_number, confirmed, released, created_at
        FROM deposits ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

pub(crate) async fn events(pool: &SqlitePool) -> Vec<OnChainEvent> {
    sqlx::query_as(
        r#"
        SELECT id, chain, block_number, block_hash, tx_hash, log_index, address, topics, data, processed, created_at
        FROM on_chain_events ORDER BY block_number, id
        "#,
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

pub(crate) async fn processed_block_numbers(pool: &SqlitePool) -> Vec<i64> {
    sqlx::query_scalar("SELECT block_number FROM processed_blocks ORDER BY block_number")
        .fetch_all(pool)
        .await
        .unwrap()
}

pub(crate) async fn rollback_conflict_count(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM rollback_conflicts")
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Address whose last byte is `n`.
pub(crate) fn addr(n: u8) -> Address {
    Address::with_last_byte(n)
}

/// Left-pads an address into an indexed topic word.
pub(crate) fn address_topic(address: Address) -> B256 {
    address.into_word()
}

pub(crate) fn u256_data(value: u64) -> Bytes {
    Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec())
}

pub(crate) fn approval_sig() -> B256 {
    keccak256("Approval(address,address,uint256)".as_bytes())
}

#[derive(Debug, Default)]
struct MockChainState {
    head: u64,
    /// Fork generation per block; absent means the original branch.
    branches: BTreeMap<u64, u8>,
    logs: BTreeMap<u64, Vec<LogEntry>>,
    hidden_headers: HashSet<u64>,
    failing_logs_calls: usize,
    failing_head_calls: usize,
    failing_header_calls: usize,
    logs_calls: Vec<(u64, u64)>,
    tx_counter: u64,
}

impl MockChainState {
    fn hash_of(&self, number: u64) -> B256 {
        let branch = self.branches.get(&number).copied().unwrap_or(0);
        let mut bytes = [0u8; 32];
        bytes[0] = 0xb1;
        bytes[1] = branch;
        bytes[24..].copy_from_slice(&number.to_be_bytes());
        B256::from(bytes)
    }

    fn header(&self, number: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: self.hash_of(number),
            parent_hash: self.hash_of(number.saturating_sub(1)),
        }
    }
}

/// Scriptable in-memory chain.
#[derive(Debug, Default)]
pub(crate) struct MockChain {
    state: Mutex<MockChainState>,
}

impl MockChain {
    pub(crate) fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().head = head;
        chain
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub(crate) fn hash_of(&self, number: u64) -> B256 {
        self.state.lock().unwrap().hash_of(number)
    }

    /// Appends a log to `block` on the current branch and returns it.
    pub(crate) fn push_log(
        &self,
        block: u64,
        emitter: Address,
        topics: Vec<B256>,
        data: Bytes,
    ) -> LogEntry {
        let mut state = self.state.lock().unwrap();
        state.tx_counter += 1;
        let mut tx = [0u8; 32];
        tx[0] = 0x7f;
        tx[24..].copy_from_slice(&state.tx_counter.to_be_bytes());

        let block_hash = state.hash_of(block);
        let entries = state.logs.entry(block).or_default();
        let log = LogEntry {
            address: emitter,
            topics,
            data,
            block_number: block,
            block_hash,
            transaction_hash: B256::from(tx),
            log_index: entries.len() as u64,
            removed: false,
        };
        entries.push(log.clone());
        log
    }

    pub(crate) fn push_transfer(
        &self,
        block: u64,
        token: Address,
        from: Address,
        to: Address,
        value: u64,
    ) -> LogEntry {
        self.push_log(
            block,
            token,
            vec![*TRANSFER_EVENT_SIG, address_topic(from), address_topic(to)],
            u256_data(value),
        )
    }

    /// Replaces every block from `from_block` up to the head with a new branch
    /// carrying no logs.
    pub(crate) fn reorg_from(&self, from_block: u64) {
        let mut state = self.state.lock().unwrap();
        for number in from_block..=state.head {
            *state.branches.entry(number).or_insert(0) += 1;
            state.logs.remove(&number);
        }
    }

    /// Gives `number` a new hash but keeps serving its logs with the old one,
    /// as a node load-balanced across two forks would.
    pub(crate) fn rehash_block(&self, number: u64) {
        let mut state = self.state.lock().unwrap();
        *state.branches.entry(number).or_insert(0) += 1;
    }

    /// Flags the log at `log_index` of `block` as `removed`.
    pub(crate) fn remove_log(&self, block: u64, log_index: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.logs.get_mut(&block).and_then(|logs| logs.get_mut(log_index)) {
            log.removed = true;
        }
    }

    pub(crate) fn hide_header(&self, number: u64) {
        self.state.lock().unwrap().hidden_headers.insert(number);
    }

    pub(crate) fn show_header(&self, number: u64) {
        self.state.lock().unwrap().hidden_headers.remove(&number);
    }

    /// The next `times` calls to `logs` fail transiently.
    pub(crate) fn fail_logs(&self, times: usize) {
        self.state.lock().unwrap().failing_logs_calls = times;
    }

    pub(crate) fn fail_head(&self, times: usize) {
        self.state.lock().unwrap().failing_head_calls = times;
    }

    /// The next `times` calls to `header_at` fail transiently.
    pub(crate) fn fail_header(&self, times: usize) {
        self.state.lock().unwrap().failing_header_calls = times;
    }

    pub(crate) fn logs_calls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().logs_calls.clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn latest_head(&self) -> Result<BlockHeader, RpcError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_head_calls > 0 {
            state.failing_head_calls -= 1;
            return Err(RpcError::Transient("connection reset".to_string()));
        }
        Ok(state.header(state.head))
    }

    async fn header_at(&self, number: u64) -> Result<Option<BlockHeader>, RpcError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_header_calls > 0 {
            state.failing_header_calls -= 1;
            return Err(RpcError::Transient("upstream unavailable".to_string()));
        }
        if number > state.head || state.hidden_headers.contains(&number) {
            return Ok(None);
        }
        Ok(Some(state.header(number)))
    }

    async fn logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.logs_calls.push((from, to));
        if state.failing_logs_calls > 0 {
            state.failing_logs_calls -= 1;
            return Err(RpcError::Transient("request timed out".to_string()));
        }

        let logs = state
            .logs
            .range(from..=to)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|log| filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            .filter(|log| match filter.topic0 {
                Some(topic0) => log.topics.first() == Some(&topic0),
                None => true,
            })
            .cloned()
            .collect();
        Ok(logs)
    }
}
