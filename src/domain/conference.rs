//! Conference bridge entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conference bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceBridge {
    pub id: i64,
    pub name: String,
    /// DTMF PIN required on join, if set
    pub pin: Option<String>,
    pub max_members: u32,
    pub mute_on_join: bool,
    pub announce_joins: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConferenceBridge {
    pub fn requires_pin(&self) -> bool {
        self.pin.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Repository for conference bridges
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ConferenceBridgeRepository: Send + Sync {
    async fn create(&self, bridge: &ConferenceBridge) -> crate::Result<ConferenceBridge>;

    async fn update(&self, bridge: &ConferenceBridge) -> crate::Result<()>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<ConferenceBridge>>;

    async fn list(&self) -> crate::Result<Vec<ConferenceBridge>>;
}
