//! Pipeline error types.

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no such element: {0}")]
    NoSuchElement(String),

    #[error("no such pad: {0}")]
    NoSuchPad(String),

    #[error("property {property} on {element}: {reason}")]
    Property {
        element: String,
        property: String,
        reason: String,
    },

    #[error("invalid state transition: {0}")]
    BadState(String),

    #[error("feed wire error: {0}")]
    Wire(String),

    #[error("clock error: {0}")]
    Clock(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
