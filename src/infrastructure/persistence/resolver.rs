//! Entity resolver backing flow validation

use sqlx::SqlitePool;

use crate::domain::flow::{EntityKind, EntityResolver};
use crate::Result;

/// Checks node entity references against the store.
pub struct SqliteEntityResolver {
    pool: SqlitePool,
}

impl SqliteEntityResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EntityResolver for SqliteEntityResolver {
    async fn exists(&self, kind: EntityKind, id: i64) -> Result<bool> {
        let table = match kind {
            EntityKind::InboundNumber => "inbound_numbers",
            EntityKind::Extension => "extensions",
            EntityKind::RingGroup => "ring_groups",
            EntityKind::IvrMenu => "ivr_menus",
            EntityKind::TimeSwitch => "time_switches",
            EntityKind::VoicemailBox => "voicemail_boxes",
            EntityKind::ConferenceBridge => "conference_bridges",
            EntityKind::Prompt => "audio_prompts",
        };
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE id = ?", table))
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extension::{Extension, ExtensionRepository};
    use crate::infrastructure::persistence::database::test_pool;
    use crate::infrastructure::persistence::SqliteExtensionRepository;

    #[tokio::test]
    async fn test_resolver_checks_each_kind() {
        let pool = test_pool().await;
        let extensions = SqliteExtensionRepository::new(pool.clone());
        let ext = extensions
            .create(&Extension::new("101".into(), "A".into(), "alice".into()))
            .await
            .unwrap();

        let resolver = SqliteEntityResolver::new(pool);
        assert!(resolver.exists(EntityKind::Extension, ext.id).await.unwrap());
        assert!(!resolver.exists(EntityKind::Extension, 999).await.unwrap());
        assert!(!resolver.exists(EntityKind::RingGroup, 1).await.unwrap());
        assert!(!resolver.exists(EntityKind::VoicemailBox, 1).await.unwrap());
    }
}
