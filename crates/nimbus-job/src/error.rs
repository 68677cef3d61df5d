//! Job runtime error kinds.

use nimbus_pipeline::PipelineError;
use nimbus_state::StateError;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no eater with alias {0}")]
    UnknownEater(String),

    #[error("no feeder for feed {0}")]
    UnknownFeeder(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    State(#[from] StateError),
}
