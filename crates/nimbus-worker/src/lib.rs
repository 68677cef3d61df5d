//! nimbus-worker — job spawning, supervision, and feed brokering.
//!
//! A worker hosts a job heaven: it spawns one process per component,
//! waits for each to connect back over a UNIX-domain socket, and
//! linearizes creates and shutdowns per avatar id. It also brokers
//! feed connections, handing socket descriptors into producing and
//! consuming jobs, locally over socketpairs and across machines
//! through a small TCP feed server.

pub mod error;
pub mod feedserver;
pub mod jobheaven;
pub mod jobproto;

pub use error::{WorkerError, WorkerResult};
pub use feedserver::{request_feed, FeedServer};
pub use jobheaven::{
    EaterRequestFn, HeavenConfig, JobExitFn, JobHeaven, JobInfo, TERM_GRACE,
};
pub use jobproto::{Handoff, JobToWorker};
