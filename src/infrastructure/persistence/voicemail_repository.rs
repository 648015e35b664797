//! SQLite voicemail repository

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::voicemail::{
    MessageCounts, VoicemailBox, VoicemailMessage, VoicemailRepository,
};
use crate::Result;

pub struct SqliteVoicemailRepository {
    pool: SqlitePool,
}

impl SqliteVoicemailRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_box(row: &SqliteRow) -> Result<VoicemailBox> {
    Ok(VoicemailBox {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        pin: row.try_get("pin")?,
        greeting_prompt_id: row.try_get("greeting_prompt_id")?,
        max_message_secs: row.try_get::<i64, _>("max_message_secs")? as u32,
        retention_days: row.try_get::<i64, _>("retention_days")? as u32,
        email_notify: row.try_get::<i64, _>("email_notify")? != 0,
        email_address: row.try_get("email_address")?,
        notify_extension_id: row.try_get("notify_extension_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn map_message(row: &SqliteRow) -> Result<VoicemailMessage> {
    Ok(VoicemailMessage {
        id: row.try_get("id")?,
        box_id: row.try_get("box_id")?,
        caller_id_name: row.try_get("caller_id_name")?,
        caller_id_number: row.try_get("caller_id_number")?,
        file_path: row.try_get("file_path")?,
        duration_secs: row.try_get::<i64, _>("duration_secs")? as u32,
        listened: row.try_get::<i64, _>("listened")? != 0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait::async_trait]
impl VoicemailRepository for SqliteVoicemailRepository {
    async fn create_box(&self, mailbox: &VoicemailBox) -> Result<VoicemailBox> {
        let result = sqlx::query(
            r#"
            INSERT INTO voicemail_boxes (
                name, pin, greeting_prompt_id, max_message_secs, retention_days,
                email_notify, email_address, notify_extension_id, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&mailbox.name)
        .bind(&mailbox.pin)
        .bind(mailbox.greeting_prompt_id)
        .bind(mailbox.max_message_secs as i64)
        .bind(mailbox.retention_days as i64)
        .bind(mailbox.email_notify as i64)
        .bind(&mailbox.email_address)
        .bind(mailbox.notify_extension_id)
        .bind(mailbox.created_at)
        .bind(mailbox.updated_at)
        .execute(&self.pool)
        .await?;
        let mut created = mailbox.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update_box(&self, mailbox: &VoicemailBox) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE voicemail_boxes SET
                name = ?, pin = ?, greeting_prompt_id = ?, max_message_secs = ?,
                retention_days = ?, email_notify = ?, email_address = ?,
                notify_extension_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&mailbox.name)
        .bind(&mailbox.pin)
        .bind(mailbox.greeting_prompt_id)
        .bind(mailbox.max_message_secs as i64)
        .bind(mailbox.retention_days as i64)
        .bind(mailbox.email_notify as i64)
        .bind(&mailbox.email_address)
        .bind(mailbox.notify_extension_id)
        .bind(Utc::now())
        .bind(mailbox.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_box(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM voicemail_boxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_box(&self, id: i64) -> Result<Option<VoicemailBox>> {
        let row = sqlx::query("SELECT * FROM voicemail_boxes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_box).transpose()
    }

    async fn list_boxes(&self) -> Result<Vec<VoicemailBox>> {
        let rows = sqlx::query("SELECT * FROM voicemail_boxes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_box).collect()
    }

    async fn create_message(&self, message: &VoicemailMessage) -> Result<VoicemailMessage> {
        let result = sqlx::query(
            r#"
            INSERT INTO voicemail_messages (
                box_id, caller_id_name, caller_id_number, file_path,
                duration_secs, listened, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.box_id)
        .bind(&message.caller_id_name)
        .bind(&message.caller_id_number)
        .bind(&message.file_path)
        .bind(message.duration_secs as i64)
        .bind(message.listened as i64)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        let mut created = message.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn delete_message(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM voicemail_messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_listened(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE voicemail_messages SET listened = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn messages_for_box(&self, box_id: i64) -> Result<Vec<VoicemailMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM voicemail_messages WHERE box_id = ? ORDER BY created_at DESC",
        )
        .bind(box_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_message).collect()
    }

    async fn counts_for_box(&self, box_id: i64) -> Result<MessageCounts> {
        let row = sqlx::query(
            "SELECT \
               SUM(CASE WHEN listened = 0 THEN 1 ELSE 0 END) AS new_count, \
               SUM(CASE WHEN listened = 1 THEN 1 ELSE 0 END) AS old_count \
             FROM voicemail_messages WHERE box_id = ?",
        )
        .bind(box_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageCounts {
            new: row.try_get::<Option<i64>, _>("new_count")?.unwrap_or(0) as u32,
            old: row.try_get::<Option<i64>, _>("old_count")?.unwrap_or(0) as u32,
        })
    }

    async fn messages_older_than(
        &self,
        box_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<VoicemailMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM voicemail_messages WHERE box_id = ? AND created_at < ?",
        )
        .bind(box_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::test_pool;
    use chrono::Duration;

    fn mailbox() -> VoicemailBox {
        VoicemailBox {
            id: 0,
            name: "reception".into(),
            pin: Some("0000".into()),
            greeting_prompt_id: None,
            max_message_secs: 60,
            retention_days: 30,
            email_notify: true,
            email_address: Some("reception@example.com".into()),
            notify_extension_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(box_id: i64, listened: bool, age_days: i64) -> VoicemailMessage {
        VoicemailMessage {
            id: 0,
            box_id,
            caller_id_name: None,
            caller_id_number: "0400111222".into(),
            file_path: format!("voicemail/box_{}/x.wav", box_id),
            duration_secs: 12,
            listened,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn test_box_and_message_lifecycle() {
        let pool = test_pool().await;
        let repo = SqliteVoicemailRepository::new(pool);

        let created = repo.create_box(&mailbox()).await.unwrap();
        assert!(created.id > 0);

        repo.create_message(&message(created.id, false, 0)).await.unwrap();
        repo.create_message(&message(created.id, false, 1)).await.unwrap();
        let listened = repo.create_message(&message(created.id, true, 2)).await.unwrap();

        let counts = repo.counts_for_box(created.id).await.unwrap();
        assert_eq!(counts.new, 2);
        assert_eq!(counts.old, 1);

        repo.mark_listened(listened.id).await.unwrap();
        let messages = repo.messages_for_box(created.id).await.unwrap();
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_retention_query() {
        let pool = test_pool().await;
        let repo = SqliteVoicemailRepository::new(pool);
        let created = repo.create_box(&mailbox()).await.unwrap();

        repo.create_message(&message(created.id, false, 40)).await.unwrap();
        repo.create_message(&message(created.id, false, 1)).await.unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        let expired = repo.messages_older_than(created.id, cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
    }

    #[tokio::test]
    async fn test_counts_empty_box() {
        let pool = test_pool().await;
        let repo = SqliteVoicemailRepository::new(pool);
        let created = repo.create_box(&mailbox()).await.unwrap();
        let counts = repo.counts_for_box(created.id).await.unwrap();
        assert_eq!(counts.new, 0);
        assert_eq!(counts.old, 0);
    }
}
