use alloy_primitives::{Address, B256, U256};
use chrono::NaiveDateTime;
use sqlx::Type;
use std::{convert::TryFrom, fmt::Display, ops::Deref};

use crate::chain::types::parse_b256;
use crate::store::errors::StoreError;

/// ───── Block number ────────────────────────────────────────────────────
/// SQLite's INTEGER is signed i64, so wrap that.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Type)]
#[sqlx(transparent)]
pub(crate) struct DbBlockNumber(i64);

impl Deref for DbBlockNumber {
    type Target = i64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for DbBlockNumber {
    type Error = StoreError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        i64::try_from(value)
            .map(Self)
            .map_err(|_| StoreError::Corrupt(format!("block number {value} exceeds i64")))
    }
}

impl From<DbBlockNumber> for u64 {
    fn from(value: DbBlockNumber) -> Self {
        value.0.max(0) as u64
    }
}

impl Display for DbBlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ───── 32-byte hash (block or transaction) ────────────────────────────
/// Stored as `0x` + 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type)]
#[sqlx(transparent)]
pub(crate) struct DbHash(String);

impl Deref for DbHash {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<B256> for DbHash {
    fn from(hash: B256) -> Self {
        Self(format!("{hash:#x}"))
    }
}

impl Display for DbHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// ───── Address ─────────────────────────────────────────────────────────
/// The single canonical form at the store boundary: `0x` + 40 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type)]
#[sqlx(transparent)]
pub(crate) struct DbAddress(String);

#[cfg(test)]
impl DbAddress {
    /// Canonicalises an externally supplied address string.
    pub(crate) fn canonical(raw: &str) -> Self {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        Self(format!("0x{}", body.to_ascii_lowercase()))
    }
}

impl Deref for DbAddress {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Address> for DbAddress {
    fn from(address: Address) -> Self {
        Self(format!("{address:#x}"))
    }
}

impl Display for DbAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// ───── Token amount ────────────────────────────────────────────────────
/// Base-10 text so that full uint256 values survive losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Type)]
#[sqlx(transparent)]
pub(crate) struct DbAmount(String);

impl Deref for DbAmount {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<U256> for DbAmount {
    fn from(value: U256) -> Self {
        Self(value.to_string())
    }
}

impl Display for DbAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// ───── Log topics ──────────────────────────────────────────────────────
/// JSON array of canonical hex words, so the serialisation is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Type)]
#[sqlx(transparent)]
pub(crate) struct DbTopics(String);

impl From<&[B256]> for DbTopics {
    fn from(topics: &[B256]) -> Self {
        let words: Vec<String> = topics.iter().map(|t| format!("{t:#x}")).collect();
        // A Vec<String> always serialises.
        Self(serde_json::to_string(&words).unwrap_or_else(|_| "[]".to_string()))
    }
}

impl TryFrom<&DbTopics> for Vec<B256> {
    type Error = StoreError;

    fn try_from(topics: &DbTopics) -> Result<Self, Self::Error> {
        let words: Vec<String> = serde_json::from_str(&topics.0)
            .map_err(|e| StoreError::Corrupt(format!("topics are not a JSON array: {e}")))?;
        words
            .iter()
            .map(|w| parse_b256(w).map_err(StoreError::Corrupt))
            .collect()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Type)]
#[sqlx(transparent)]
pub(crate) struct DbTimestamp(NaiveDateTime);

impl DbTimestamp {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now().naive_utc())
    }
}

impl Deref for DbTimestamp {
    type Target = NaiveDateTime;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
