//! Inbound number (DID) - maps a dialled pattern to a call flow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inbound number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundNumber {
    pub id: i64,
    /// Exact dialled string, e.g. "5551000"
    pub number: String,
    pub label: String,
    /// Restrict matching to calls arriving on this trunk
    pub trunk_id: Option<i64>,
    /// Published flow handling calls to this number
    pub flow_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for inbound numbers
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait InboundNumberRepository: Send + Sync {
    async fn create(&self, did: &InboundNumber) -> crate::Result<InboundNumber>;

    async fn update(&self, did: &InboundNumber) -> crate::Result<()>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<InboundNumber>>;

    /// Exact-match lookup used on every inbound INVITE. A DID bound to a
    /// trunk only matches calls from that trunk; an unbound DID matches any.
    async fn match_number(&self, number: &str, trunk_id: Option<i64>)
        -> crate::Result<Option<InboundNumber>>;

    async fn list(&self) -> crate::Result<Vec<InboundNumber>>;
}
