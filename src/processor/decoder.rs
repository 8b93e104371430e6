use alloy_primitives::{keccak256, B256};
use alloy_sol_types::{sol, SolEvent};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::store::models::OnChainEvent;

sol! {
    /// ERC-20 `Transfer`.
    #[derive(Debug, PartialEq, Eq)]
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Transfer topic selector (keccak256 hash of event signature)
pub(crate) static TRANSFER_EVENT_SIG: Lazy<B256> =
    Lazy::new(|| keccak256(Transfer::SIGNATURE.as_bytes()));

/// Why a stored event is not an ERC-20 transfer. None of these is an error:
/// the processor marks such events processed and moves on.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum NotATransfer {
    #[error("log has no topics")]
    NoTopics,

    #[error("topic0 {0} is not the Transfer selector")]
    WrongSignature(B256),

    #[error("expected at least 3 topics, got {0}")]
    MissingTopics(usize),

    #[error("value must be one 32-byte word, got {0} bytes")]
    MalformedData(usize),

    #[error("stored topics are unreadable: {0}")]
    UnreadableTopics(String),
}

/// Decodes raw log parts into a [`Transfer`].
///
/// Extra topics beyond the third are tolerated; the `value` word must be
/// exactly 32 bytes.
pub(crate) fn decode_transfer(topics: &[B256], data: &[u8]) -> Result<Transfer, NotATransfer> {
    let topic0 = topics.first().ok_or(NotATransfer::NoTopics)?;
    if *topic0 != *TRANSFER_EVENT_SIG {
        return Err(NotATransfer::WrongSignature(*topic0));
    }
    if topics.len() < 3 {
        return Err(NotATransfer::MissingTopics(topics.len()));
    }
    if data.len() != 32 {
        return Err(NotATransfer::MalformedData(data.len()));
    }

    Transfer::decode_raw_log(topics[..3].iter().copied(), data, false)
        .map_err(|_| NotATransfer::MalformedData(data.len()))
}

/// Decodes a persisted event.
pub(crate) fn decode_event(event: &OnChainEvent) -> Result<Transfer, NotATransfer> {
    let topics = Vec::<B256>::try_from(&event.topics)
        .map_err(|e| NotATransfer::UnreadableTopics(e.to_string()))?;
    decode_transfer(&topics, &event.data)
}
