//! nimbus-core — shared domain types for the Nimbus streaming planet.
//!
//! Everything that more than one process needs to agree on lives here:
//! component moods and their policy predicates, avatar and feed
//! identifiers, structured component messages, the planet configuration
//! document, the StartSet start/shutdown serializer, and the error
//! kinds that cross process boundaries.

pub mod config;
pub mod error;
pub mod ids;
pub mod messages;
pub mod moods;
pub mod startset;

pub use config::PlanetConfig;
pub use error::{Error, Result};
pub use ids::{AvatarId, FeedId};
pub use messages::{ComponentMessage, MessageLevel};
pub use moods::Mood;
pub use startset::{CreatePending, ShutdownPending, StartSet};

/// Wall-clock time as fractional epoch seconds.
///
/// Activity timestamps (last-connect, last-activity, ...) are carried
/// as f64 seconds everywhere in the planet state.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
