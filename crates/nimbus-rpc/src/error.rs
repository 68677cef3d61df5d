//! RPC error types.

use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("remote error: {0}")]
    Remote(nimbus_core::Error),

    #[error("frame error: {0}")]
    Frame(String),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The cross-process error kind, when one survived the wire.
    pub fn remote_kind(&self) -> Option<&nimbus_core::Error> {
        match self {
            RpcError::Remote(kind) => Some(kind),
            _ => None,
        }
    }
}
