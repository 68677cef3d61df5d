//! Identifiers — avatar ids and feed ids.
//!
//! An avatar id names a component by its container:
//! `/flow-name/component-name` or `/atmosphere/component-name`.
//! A feed id names one output of one component: `component:feed`.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name of the container holding components outside any flow.
pub const ATMOSPHERE: &str = "atmosphere";

/// A component's address within the planet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AvatarId {
    /// The flow name, or `"atmosphere"`.
    pub container: String,
    pub component: String,
}

impl AvatarId {
    pub fn new(container: &str, component: &str) -> Self {
        Self {
            container: container.to_string(),
            component: component.to_string(),
        }
    }

    /// Parse `"/container/component"`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut parts = s.strip_prefix('/').unwrap_or(s).splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(container), Some(component))
                if !container.is_empty() && !component.is_empty() =>
            {
                Ok(Self::new(container, component))
            }
            _ => Err(Error::InvalidId(s.to_string())),
        }
    }

    pub fn is_atmosphere(&self) -> bool {
        self.container == ATMOSPHERE
    }
}

impl std::fmt::Display for AvatarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.container, self.component)
    }
}

/// One output of one component: `component:feed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedId {
    pub component: String,
    pub feed: String,
}

impl FeedId {
    pub fn new(component: &str, feed: &str) -> Self {
        Self {
            component: component.to_string(),
            feed: feed.to_string(),
        }
    }

    /// Parse `"component:feed"`. A bare component name implies the
    /// `default` feed.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.split_once(':') {
            Some((component, feed)) if !component.is_empty() && !feed.is_empty() => {
                Ok(Self::new(component, feed))
            }
            None if !s.is_empty() => Ok(Self::new(s, "default")),
            _ => Err(Error::InvalidId(s.to_string())),
        }
    }
}

impl std::fmt::Display for FeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.component, self.feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_id_parses_flow_and_atmosphere() {
        let id = AvatarId::parse("/default/muxer-video").unwrap();
        assert_eq!(id.container, "default");
        assert_eq!(id.component, "muxer-video");
        assert!(!id.is_atmosphere());

        let id = AvatarId::parse("/atmosphere/porter").unwrap();
        assert!(id.is_atmosphere());
        assert_eq!(id.to_string(), "/atmosphere/porter");
    }

    #[test]
    fn avatar_id_rejects_malformed() {
        assert!(AvatarId::parse("").is_err());
        assert!(AvatarId::parse("/").is_err());
        assert!(AvatarId::parse("/onlycontainer").is_err());
        assert!(AvatarId::parse("//component").is_err());
    }

    #[test]
    fn feed_id_parses_and_defaults() {
        let id = FeedId::parse("producer:video").unwrap();
        assert_eq!(id.component, "producer");
        assert_eq!(id.feed, "video");

        let id = FeedId::parse("producer").unwrap();
        assert_eq!(id.feed, "default");
        assert_eq!(id.to_string(), "producer:default");
    }
}
