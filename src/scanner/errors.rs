use thiserror::Error;

use crate::chain::errors::RpcError;
use crate::store::errors::StoreError;

/// Error types of the scanner and the reorg detector
#[derive(Debug, Error)]
pub(crate) enum ScanError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// None of the checked cursor markers is canonical any more.
    #[error("reorg deeper than the {depth} checked blocks, state rolled back to block {pivot}")]
    DeepReorg { depth: u32, pivot: u64 },

    #[error("rollback to block {pivot} blocked by {deposits} released deposit(s)")]
    RollbackConflict { pivot: u64, deposits: usize },
}

impl ScanError {
    /// Everything except RPC trouble needs an operator.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(self, ScanError::Rpc(_))
    }
}
