//! SQLite extension repository

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::extension::{
    Extension, ExtensionRepository, FollowMeConfig, RecordingPolicy,
};
use crate::{DomainError, Result};

pub struct SqliteExtensionRepository {
    pool: SqlitePool,
}

impl SqliteExtensionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn recording_policy_str(policy: RecordingPolicy) -> &'static str {
    match policy {
        RecordingPolicy::Never => "never",
        RecordingPolicy::Inbound => "inbound",
        RecordingPolicy::Outbound => "outbound",
        RecordingPolicy::Always => "always",
    }
}

fn map_row(row: &SqliteRow) -> Result<Extension> {
    let follow_me_raw: String = row.try_get("follow_me")?;
    let follow_me: FollowMeConfig =
        serde_json::from_str(&follow_me_raw).unwrap_or_default();
    let recording_policy = match row.try_get::<String, _>("recording_policy")?.as_str() {
        "inbound" => RecordingPolicy::Inbound,
        "outbound" => RecordingPolicy::Outbound,
        "always" => RecordingPolicy::Always,
        _ => RecordingPolicy::Never,
    };
    Ok(Extension {
        id: row.try_get("id")?,
        number: row.try_get("number")?,
        display_name: row.try_get("display_name")?,
        sip_username: row.try_get("sip_username")?,
        password_hash: row.try_get("password_hash")?,
        ha1_md5: row.try_get("ha1_md5")?,
        ha1_sha256: row.try_get("ha1_sha256")?,
        ring_timeout_secs: row.try_get::<i64, _>("ring_timeout_secs")? as u32,
        do_not_disturb: row.try_get::<i64, _>("do_not_disturb")? != 0,
        follow_me,
        recording_policy,
        max_registrations: row.try_get::<i64, _>("max_registrations")? as u32,
        voicemail_box_id: row.try_get("voicemail_box_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl ExtensionRepository for SqliteExtensionRepository {
    async fn create(&self, extension: &Extension) -> Result<Extension> {
        let follow_me = serde_json::to_string(&extension.follow_me)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO extensions (
                number, display_name, sip_username, password_hash, ha1_md5, ha1_sha256,
                ring_timeout_secs, do_not_disturb, follow_me, recording_policy,
                max_registrations, voicemail_box_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&extension.number)
        .bind(&extension.display_name)
        .bind(&extension.sip_username)
        .bind(&extension.password_hash)
        .bind(&extension.ha1_md5)
        .bind(&extension.ha1_sha256)
        .bind(extension.ring_timeout_secs as i64)
        .bind(extension.do_not_disturb as i64)
        .bind(&follow_me)
        .bind(recording_policy_str(extension.recording_policy))
        .bind(extension.max_registrations as i64)
        .bind(extension.voicemail_box_id)
        .bind(extension.created_at)
        .bind(extension.updated_at)
        .execute(&self.pool)
        .await?;

        let mut created = extension.clone();
        created.id = result.last_insert_rowid();
        debug!(id = created.id, number = %created.number, "extension created");
        Ok(created)
    }

    async fn update(&self, extension: &Extension) -> Result<()> {
        let follow_me = serde_json::to_string(&extension.follow_me)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE extensions SET
                number = ?, display_name = ?, sip_username = ?,
                ring_timeout_secs = ?, do_not_disturb = ?, follow_me = ?,
                recording_policy = ?, max_registrations = ?, voicemail_box_id = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&extension.number)
        .bind(&extension.display_name)
        .bind(&extension.sip_username)
        .bind(extension.ring_timeout_secs as i64)
        .bind(extension.do_not_disturb as i64)
        .bind(&follow_me)
        .bind(recording_policy_str(extension.recording_policy))
        .bind(extension.max_registrations as i64)
        .bind(extension.voicemail_box_id)
        .bind(Utc::now())
        .bind(extension.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM extensions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<Extension>> {
        let row = sqlx::query("SELECT * FROM extensions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn get_by_number(&self, number: &str) -> Result<Option<Extension>> {
        let row = sqlx::query("SELECT * FROM extensions WHERE number = ?")
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn get_by_sip_username(&self, username: &str) -> Result<Option<Extension>> {
        let row = sqlx::query("SELECT * FROM extensions WHERE sip_username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn list(&self) -> Result<Vec<Extension>> {
        let rows = sqlx::query("SELECT * FROM extensions ORDER BY number")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_row).collect()
    }

    async fn set_password(
        &self,
        id: i64,
        password_hash: &str,
        ha1_md5: &str,
        ha1_sha256: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE extensions SET password_hash = ?, ha1_md5 = ?, ha1_sha256 = ?, updated_at = ? WHERE id = ?",
        )
        .bind(password_hash)
        .bind(ha1_md5)
        .bind(ha1_sha256)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound(format!("extension {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extension::{FollowMeLeg, FollowMeStrategy};
    use crate::infrastructure::persistence::database::test_pool;

    #[tokio::test]
    async fn test_create_and_fetch() {
        let pool = test_pool().await;
        let repo = SqliteExtensionRepository::new(pool);

        let mut ext = Extension::new("101".into(), "Alice".into(), "alice".into());
        ext.follow_me = FollowMeConfig {
            enabled: true,
            strategy: FollowMeStrategy::Sequential,
            legs: vec![FollowMeLeg {
                number: "0400111222".into(),
                delay_secs: 0,
                timeout_secs: 25,
                confirm: false,
            }],
        };
        let created = repo.create(&ext).await.unwrap();
        assert!(created.id > 0);

        let fetched = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.number, "101");
        assert_eq!(fetched.sip_username, "alice");
        assert!(fetched.follow_me.enabled);
        assert_eq!(fetched.follow_me.legs.len(), 1);

        let by_user = repo.get_by_sip_username("alice").await.unwrap().unwrap();
        assert_eq!(by_user.id, created.id);
        let by_number = repo.get_by_number("101").await.unwrap().unwrap();
        assert_eq!(by_number.id, created.id);
    }

    #[tokio::test]
    async fn test_sip_username_unique() {
        let pool = test_pool().await;
        let repo = SqliteExtensionRepository::new(pool);

        repo.create(&Extension::new("101".into(), "A".into(), "alice".into()))
            .await
            .unwrap();
        let dup = repo
            .create(&Extension::new("102".into(), "B".into(), "alice".into()))
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_set_password_updates_all_digests() {
        let pool = test_pool().await;
        let repo = SqliteExtensionRepository::new(pool);
        let created = repo
            .create(&Extension::new("101".into(), "A".into(), "alice".into()))
            .await
            .unwrap();

        repo.set_password(created.id, "$argon2id$...", "md5digest", "sha256digest")
            .await
            .unwrap();
        let fetched = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.password_hash, "$argon2id$...");
        assert_eq!(fetched.ha1_md5, "md5digest");
        assert_eq!(fetched.ha1_sha256, "sha256digest");

        let missing = repo.set_password(9999, "x", "y", "z").await;
        assert!(matches!(missing, Err(DomainError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let pool = test_pool().await;
        let repo = SqliteExtensionRepository::new(pool);
        let mut created = repo
            .create(&Extension::new("101".into(), "A".into(), "alice".into()))
            .await
            .unwrap();

        created.do_not_disturb = true;
        created.ring_timeout_secs = 40;
        repo.update(&created).await.unwrap();
        let fetched = repo.get(created.id).await.unwrap().unwrap();
        assert!(fetched.do_not_disturb);
        assert_eq!(fetched.ring_timeout_secs, 40);

        repo.delete(created.id).await.unwrap();
        assert!(repo.get(created.id).await.unwrap().is_none());
    }
}
