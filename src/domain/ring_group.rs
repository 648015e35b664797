//! Ring group - a set of extensions rung with a strategy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How members of the group are rung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingStrategy {
    /// All members at once, first answer wins
    RingAll,
    /// Rotate through members, remembering the last one used
    RoundRobin,
    /// Uniform random order, sequential
    Random,
    /// Member whose last answered call ended longest ago
    LongestIdle,
}

impl RingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RingStrategy::RingAll => "ring_all",
            RingStrategy::RoundRobin => "round_robin",
            RingStrategy::Random => "random",
            RingStrategy::LongestIdle => "longest_idle",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ring_all" => Some(RingStrategy::RingAll),
            "round_robin" => Some(RingStrategy::RoundRobin),
            "random" => Some(RingStrategy::Random),
            "longest_idle" => Some(RingStrategy::LongestIdle),
            _ => None,
        }
    }
}

/// Ring group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingGroup {
    pub id: i64,
    pub name: String,
    pub strategy: RingStrategy,
    /// Member extension ids in configured order
    pub extension_ids: Vec<i64>,
    /// Overall ring timeout (seconds)
    pub ring_timeout_secs: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for ring groups
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RingGroupRepository: Send + Sync {
    async fn create(&self, group: &RingGroup) -> crate::Result<RingGroup>;

    async fn update(&self, group: &RingGroup) -> crate::Result<()>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<RingGroup>>;

    async fn list(&self) -> crate::Result<Vec<RingGroup>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_roundtrip() {
        for s in [
            RingStrategy::RingAll,
            RingStrategy::RoundRobin,
            RingStrategy::Random,
            RingStrategy::LongestIdle,
        ] {
            assert_eq!(RingStrategy::from_str(s.as_str()), Some(s));
        }
        assert_eq!(RingStrategy::from_str("hunt"), None);
    }
}
