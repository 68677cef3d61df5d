//! nimbus-rpc — the symmetric object protocol between processes.
//!
//! Length-prefixed JSON envelopes over any byte stream, with
//! asynchronous calls, remote object references, replicated-state
//! events with acknowledgements, and SCM_RIGHTS fd passing for the
//! worker↔job handoffs.

pub mod connection;
pub mod error;
pub mod fdpassing;
pub mod frame;
pub mod message;
pub mod observer;

pub use connection::{AckFuture, CallFuture, Connection, PeerHandler};
pub use error::{RpcError, RpcResult};
pub use message::{Envelope, RemoteRef};
pub use observer::RemoteObserver;
