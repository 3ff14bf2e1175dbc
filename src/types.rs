//! Shared provenance and confidence types.
//!
//! [`Source`] is persisted on every chunk; [`ConfidenceTier`] is derived at query time
//! and never stored.

use serde::{Deserialize, Serialize};

/// Where a piece of knowledge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Said directly by the user.
    UserStated,
    /// Read from a workspace file.
    File,
    /// Found via web search.
    WebSearch,
    /// Produced by a heartbeat task.
    HeartbeatDiscovery,
}

impl Source {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserStated => "user_stated",
            Self::File => "file",
            Self::WebSearch => "web_search",
            Self::HeartbeatDiscovery => "heartbeat_discovery",
        }
    }
}

impl Default for Source {
    fn default() -> Self {
        Self::File
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_stated" => Ok(Self::UserStated),
            "file" => Ok(Self::File),
            "web_search" => Ok(Self::WebSearch),
            "heartbeat_discovery" => Ok(Self::HeartbeatDiscovery),
            _ => Err(format!("unknown source: {s}")),
        }
    }
}

/// Ordered confidence: `None < Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    None,
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// One step down, saturating at `None`.
    pub fn lowered(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium => Self::Low,
            Self::Low | Self::None => Self::None,
        }
    }
}

impl std::fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConfidenceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("unknown confidence: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_str() {
        for s in [
            Source::UserStated,
            Source::File,
            Source::WebSearch,
            Source::HeartbeatDiscovery,
        ] {
            assert_eq!(s.as_str().parse::<Source>().unwrap(), s);
        }
        assert!("rumor".parse::<Source>().is_err());
    }

    #[test]
    fn tiers_are_ordered_and_lower_saturates() {
        assert!(ConfidenceTier::None < ConfidenceTier::Low);
        assert!(ConfidenceTier::Medium < ConfidenceTier::High);
        assert_eq!(ConfidenceTier::High.lowered(), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::None.lowered(), ConfidenceTier::None);
        assert_eq!("HIGH".parse::<ConfidenceTier>().unwrap(), ConfidenceTier::High);
    }
}
