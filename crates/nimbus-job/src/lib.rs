//! nimbus-job — the feed-component job runtime.
//!
//! A job process hosts exactly one component. This crate provides the
//! runtime for feed components: the pipeline wrapped with eaters (fd
//! sources with reconnection) and feeders (multi-client fd sinks with
//! per-client accounting), pad liveness monitors, the mood state
//! machine, and the master-clock operations.

pub mod error;
pub mod feedcomponent;
pub mod padmonitor;

pub use error::{JobError, JobResult};
pub use feedcomponent::{
    CleanupFn, FeedComponent, ReconnectRequestFn, RuntimeTiming, STATS_INTERVAL,
};
pub use padmonitor::{
    MonitorTiming, PadMonitor, PadMonitorSet, ReconnectFn, WatchFn, CHECK_INTERVAL,
    PROBE_INTERVAL,
};
