//! nimbus-admin — the client side of the planet.
//!
//! An [`AdminLink`] mirrors one manager's planet and worker-heaven
//! trees and issues typed commands; a [`MultiAdmin`] supervises links
//! to several managers at once.

pub mod link;
pub mod multi;

pub use link::{
    AdminLink, BoxTransport, ConnectFuture, Connector, LinkStatus, ReconnectPolicy, Transport,
};
pub use multi::MultiAdmin;
