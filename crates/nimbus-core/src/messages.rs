//! Structured component messages.
//!
//! Components surface operator-visible conditions as messages in their
//! state; a message id identifies a condition so that re-posting the
//! same condition replaces the old entry instead of accumulating.

use serde::{Deserialize, Serialize};

use crate::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Error,
    Warning,
    Info,
}

/// An operator-visible message attached to a component's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMessage {
    pub level: MessageLevel,
    /// Condition identifier; appending a message with an id already
    /// present replaces the previous entry.
    pub id: String,
    pub text: String,
    /// Debug detail (tracebacks, element error debug strings).
    #[serde(default)]
    pub debug: Option<String>,
    /// Epoch seconds at creation.
    pub timestamp: f64,
}

impl ComponentMessage {
    pub fn new(level: MessageLevel, id: &str, text: &str) -> Self {
        Self {
            level,
            id: id.to_string(),
            text: text.to_string(),
            debug: None,
            timestamp: now_secs(),
        }
    }

    pub fn error(id: &str, text: &str) -> Self {
        Self::new(MessageLevel::Error, id, text)
    }

    pub fn warning(id: &str, text: &str) -> Self {
        Self::new(MessageLevel::Warning, id, text)
    }

    pub fn info(id: &str, text: &str) -> Self {
        Self::new(MessageLevel::Info, id, text)
    }

    pub fn with_debug(mut self, debug: &str) -> Self {
        self.debug = Some(debug.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_carries_level_and_debug() {
        let msg = ComponentMessage::error("pipeline-error", "element gdppay failed")
            .with_debug("gstgdppay.c(401): chain");
        assert_eq!(msg.level, MessageLevel::Error);
        assert_eq!(msg.id, "pipeline-error");
        assert!(msg.debug.is_some());
        assert!(msg.timestamp > 0.0);
    }
}
