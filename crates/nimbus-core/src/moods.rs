//! Component moods — the lifecycle states of a component.
//!
//! The integer values are a sort-stability convention only; policy
//! decisions go through [`Mood::can_start`] and [`Mood::can_stop`],
//! never through numeric comparison.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    /// Producing output normally.
    Happy = 0,
    /// Running but starved of input.
    Hungry = 1,
    /// Starting up, not yet producing.
    Waking = 2,
    /// Not running.
    Sleeping = 3,
    /// The hosting job disappeared without a requested stop.
    Lost = 4,
    /// The pipeline reported an error; sticky until an explicit stop.
    Sad = 5,
}

impl Mood {
    /// Sort ordinal. Only for stable display ordering.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// A start command is allowed only on a sleeping component.
    pub fn can_start(self) -> bool {
        self == Mood::Sleeping
    }

    /// A stop command is allowed on anything that is not sleeping.
    pub fn can_stop(self) -> bool {
        self != Mood::Sleeping
    }

    /// Deletion is allowed exactly when a stop is not:
    /// the component must be sleeping first.
    pub fn can_delete(self) -> bool {
        !self.can_stop()
    }

    pub fn name(self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Hungry => "hungry",
            Mood::Waking => "waking",
            Mood::Sleeping => "sleeping",
            Mood::Lost => "lost",
            Mood::Sad => "sad",
        }
    }

    /// Inverse of [`Mood::ordinal`].
    pub fn from_ordinal(n: u8) -> Option<Mood> {
        match n {
            0 => Some(Mood::Happy),
            1 => Some(Mood::Hungry),
            2 => Some(Mood::Waking),
            3 => Some(Mood::Sleeping),
            4 => Some(Mood::Lost),
            5 => Some(Mood::Sad),
            _ => None,
        }
    }

    /// Parse a mood from its wire name.
    pub fn parse(s: &str) -> Option<Mood> {
        match s {
            "happy" => Some(Mood::Happy),
            "hungry" => Some(Mood::Hungry),
            "waking" => Some(Mood::Waking),
            "sleeping" => Some(Mood::Sleeping),
            "lost" => Some(Mood::Lost),
            "sad" => Some(Mood::Sad),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(Mood::Happy.ordinal(), 0);
        assert_eq!(Mood::Hungry.ordinal(), 1);
        assert_eq!(Mood::Waking.ordinal(), 2);
        assert_eq!(Mood::Sleeping.ordinal(), 3);
        assert_eq!(Mood::Lost.ordinal(), 4);
        assert_eq!(Mood::Sad.ordinal(), 5);
    }

    #[test]
    fn start_only_from_sleeping() {
        assert!(Mood::Sleeping.can_start());
        for mood in [Mood::Happy, Mood::Hungry, Mood::Waking, Mood::Lost, Mood::Sad] {
            assert!(!mood.can_start(), "{mood} should not allow start");
            assert!(mood.can_stop(), "{mood} should allow stop");
        }
    }

    #[test]
    fn delete_is_the_complement_of_stop() {
        for mood in [
            Mood::Happy,
            Mood::Hungry,
            Mood::Waking,
            Mood::Sleeping,
            Mood::Lost,
            Mood::Sad,
        ] {
            assert_eq!(mood.can_delete(), !mood.can_stop());
        }
    }

    #[test]
    fn parse_round_trips() {
        for mood in [Mood::Happy, Mood::Sleeping, Mood::Sad] {
            assert_eq!(Mood::parse(mood.name()), Some(mood));
        }
        assert_eq!(Mood::parse("grumpy"), None);
    }
}
