use alloy_primitives::{Address, Bytes, B256, U64};
use serde::{Deserialize, Deserializer};

/// An Ethereum log entry as returned by `eth_getLogs`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogEntry {
    /// The emitting contract address
    pub(crate) address: Address,
    /// Indexed event parameters, `topics[0]` being the event selector
    pub(crate) topics: Vec<B256>,
    /// ABI-encoded non-indexed event data
    pub(crate) data: Bytes,

    #[serde(deserialize_with = "quantity")]
    pub(crate) block_number: u64,

    pub(crate) block_hash: B256,

    pub(crate) transaction_hash: B256,

    /// Position of the log within its block
    #[serde(deserialize_with = "quantity")]
    pub(crate) log_index: u64,

    /// Set by nodes for logs that were reverted by a reorg
    #[serde(default)]
    pub(crate) removed: bool,
}

/// Subset of an `eth_getBlockByNumber` result, fetched without transaction bodies.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BlockHeader {
    #[serde(deserialize_with = "quantity")]
    pub(crate) number: u64,

    pub(crate) hash: B256,

    pub(crate) parent_hash: B256,
}

/// Optional restrictions applied to `eth_getLogs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LogFilter {
    /// Only return logs emitted by these contracts (empty = any contract)
    pub(crate) addresses: Vec<Address>,
    /// Only return logs whose first topic equals this selector
    pub(crate) topic0: Option<B256>,
}

/// JSON-RPC quantity (`"0x1b4"`) that must fit in a `u64`.
fn quantity<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(U64::deserialize(deserializer)?.to::<u64>())
}

/// Parses a `0x`-prefixed (or bare) 32-byte hex word.
pub(crate) fn parse_b256(s: &str) -> Result<B256, String> {
    s.trim().parse::<B256>().map_err(|e| format!("invalid 32-byte word {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_rpc_log() {
        let raw = json!({
            "address": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "topics": [
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef",
                "0x000000000000000000000000000000000000000000000000000000000000beef"
            ],
            "data": "0x00000000000000000000000000000000000000000000000000000000000003e8",
            "blockNumber": "0x1b4",
            "blockHash": "0x0000000000000000000000000000000000000000000000000000000000000001",
            "transactionHash": "0x0000000000000000000000000000000000000000000000000000000000000002",
            "transactionIndex": "0x0",
            "logIndex": "0x3"
        });

        let log: LogEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(log.block_number, 436);
        assert_eq!(log.log_index, 3);
        assert_eq!(log.topics.len(), 2);
        assert_eq!(log.data.len(), 32);
        assert!(!log.removed);
    }

    #[test]
    fn rejects_short_hash() {
        let raw = json!({ "number": "0x1", "hash": "0x1234", "parentHash": "0x1234" });
        assert!(serde_json::from_value::<BlockHeader>(raw).is_err());
    }

    #[test]
    fn rejects_quantity_wider_than_u64() {
        let raw = json!({
            "number": "0x10000000000000000",
            "hash": format!("0x{}", "11".repeat(32)),
            "parentHash": format!("0x{}", "22".repeat(32)),
        });
        assert!(serde_json::from_value::<BlockHeader>(raw).is_err());
    }

    #[test]
    fn parse_b256_accepts_bare_hex() {
        let word = "11".repeat(32);
        assert_eq!(parse_b256(&word).unwrap(), B256::repeat_byte(0x11));
        assert!(parse_b256("0xzz").is_err());
    }
}
