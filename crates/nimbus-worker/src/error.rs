//! Worker error kinds.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no job for avatar {0}")]
    UnknownJob(String),

    #[error("job {0} has not connected back yet")]
    NotConnected(String),

    #[error("feed request refused: {0}")]
    FeedRefused(String),

    #[error("bad feed request: {0}")]
    BadFeedRequest(String),

    #[error(transparent)]
    Rpc(#[from] nimbus_rpc::RpcError),

    #[error(transparent)]
    Core(#[from] nimbus_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
