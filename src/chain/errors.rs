use thiserror::Error;

/// Failures of the JSON-RPC chain adapter.
#[derive(Debug, Error)]
pub(crate) enum RpcError {
    /// Connection problems, timeouts, rate limits and node-side rejections.
    /// Retrying with a narrower range may succeed.
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// The node answered, but not with something we understand.
    #[error("permanent RPC failure: {0}")]
    Permanent(String),
}

impl RpcError {
    pub(crate) fn is_permanent(&self) -> bool {
        matches!(self, RpcError::Permanent(_))
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return RpcError::Permanent(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                RpcError::Permanent(err.to_string())
            }
            _ => RpcError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Permanent(err.to_string())
    }
}
