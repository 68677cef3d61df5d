//! nimbus-manager — the planet authority.
//!
//! Owns the authoritative planet and worker-heaven state, loads
//! configuration, drives component lifecycle against the mood policy,
//! arbitrates moods when jobs disappear, elects per-flow clock
//! masters, and replicates the whole tree to attached admins.

pub mod admins;
pub mod links;
pub mod manager;

pub use admins::AdminFanout;
pub use links::{ComponentLink, LinkFuture, RemoteComponentLink, RemoteWorkerLink, WorkerLink};
pub use manager::{ClockMaster, Manager};
