use crate::chain::types::LogEntry;
use crate::store::errors::StoreError;
use crate::store::types::{
    DbAddress, DbAmount, DbBlockNumber, DbHash, DbTimestamp, DbTopics,
};

/// Marker that every event up to and including `block_number` is persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ProcessedBlock {
    pub(crate) id: i64,
    pub(crate) chain: String,
    pub(crate) block_number: DbBlockNumber,
    pub(crate) block_hash: DbHash,
    pub(crate) created_at: DbTimestamp,
}

/// A single persisted log emission.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct OnChainEvent {
    pub(crate) id: i64,
    pub(crate) chain: String,
    pub(crate) block_number: DbBlockNumber,
    pub(crate) block_hash: DbHash,
    pub(crate) tx_hash: DbHash,
    pub(crate) log_index: i64,
    /// Contract that emitted the log
    pub(crate) address: DbAddress,
    pub(crate) topics: DbTopics,
    pub(crate) data: Vec<u8>,
    pub(crate) processed: bool,
    pub(crate) created_at: DbTimestamp,
}

/// An event about to be inserted by the scanner.
#[derive(Debug, Clone)]
pub(crate) struct NewOnChainEvent {
    pub(crate) chain: String,
    pub(crate) block_number: DbBlockNumber,
    pub(crate) block_hash: DbHash,
    pub(crate) tx_hash: DbHash,
    pub(crate) log_index: i64,
    pub(crate) address: DbAddress,
    pub(crate) topics: DbTopics,
    pub(crate) data: Vec<u8>,
}

impl NewOnChainEvent {
    pub(crate) fn from_log(chain: &str, log: &LogEntry) -> Result<Self, StoreError> {
        let log_index = i64::try_from(log.log_index)
            .map_err(|_| StoreError::Corrupt(format!("log index {} exceeds i64", log.log_index)))?;

        Ok(Self {
            chain: chain.to_string(),
            block_number: DbBlockNumber::try_from(log.block_number)?,
            block_hash: DbHash::from(log.block_hash),
            tx_hash: DbHash::from(log.transaction_hash),
            log_index,
            address: DbAddress::from(log.address),
            topics: DbTopics::from(log.topics.as_slice()),
            data: log.data.to_vec(),
        })
    }
}

/// Pre-generated custodial address.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AddressPoolEntry {
    pub(crate) id: i64,
    pub(crate) chain: String,
    pub(crate) address: DbAddress,
    pub(crate) user_id: Option<i64>,
    pub(crate) used: bool,
}

/// User-visible credit.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct Deposit {
    pub(crate) id: i64,
    pub(crate) chain: String,
    /// Token contract for ERC-20 deposits, `None` for native transfers
    pub(crate) token: Option<DbAddress>,
    pub(crate) to_address: DbAddress,
    pub(crate) user_id: Option<i64>,
    pub(crate) amount: DbAmount,
    pub(crate) tx_hash: DbHash,
    pub(crate) log_index: i64,
    pub(crate) block_number: DbBlockNumber,
    pub(crate) confirmed: bool,
    /// Written by the balance service once the credit is spendable
    pub(crate) released: bool,
    pub(crate) created_at: DbTimestamp,
}

#[derive(Debug, Clone)]
pub(crate) struct NewDeposit {
    pub(crate) chain: String,
    pub(crate) token: Option<DbAddress>,
    pub(crate) to_address: DbAddress,
    pub(crate) user_id: Option<i64>,
    pub(crate) amount: DbAmount,
    pub(crate) tx_hash: DbHash,
    pub(crate) log_index: i64,
    pub(crate) block_number: DbBlockNumber,
    pub(crate) confirmed: bool,
}

/// What a committed `rollback_to` removed.
#[derive(Debug, Clone, Default)]
pub(crate) struct RollbackReport {
    pub(crate) blocks_deleted: u64,
    pub(crate) events_deleted: u64,
    /// Deposits whose source events were rewound
    pub(crate) reverted_deposits: Vec<Deposit>,
}

#[derive(Debug)]
pub(crate) enum RollbackOutcome {
    Applied(RollbackReport),
    /// Nothing was changed: these released deposits sit above the pivot.
    Conflict(Vec<Deposit>),
}
