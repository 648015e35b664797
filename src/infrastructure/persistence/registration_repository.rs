//! SQLite registration repository - the durable mirror of the binding table

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::registration::{
    BindingTransport, PushPlatform, Registration, RegistrationRepository,
};
use crate::Result;

pub struct SqliteRegistrationRepository {
    pool: SqlitePool,
}

impl SqliteRegistrationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_row(row: &SqliteRow) -> Result<Registration> {
    Ok(Registration {
        id: row.try_get("id")?,
        extension_id: row.try_get("extension_id")?,
        contact: row.try_get("contact")?,
        device_id: row.try_get("device_id")?,
        source_ip: row.try_get("source_ip")?,
        source_port: row.try_get::<i64, _>("source_port")? as u16,
        transport: row
            .try_get::<String, _>("transport")
            .ok()
            .and_then(|t| BindingTransport::from_str(&t))
            .unwrap_or(BindingTransport::Udp),
        user_agent: row.try_get("user_agent")?,
        expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
        push_token: row.try_get("push_token")?,
        push_platform: row
            .try_get::<Option<String>, _>("push_platform")?
            .and_then(|p| match p.as_str() {
                "ios" => Some(PushPlatform::Ios),
                "android" => Some(PushPlatform::Android),
                _ => None,
            }),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait::async_trait]
impl RegistrationRepository for SqliteRegistrationRepository {
    async fn upsert(&self, registration: &Registration) -> Result<Registration> {
        let platform = registration.push_platform.map(|p| match p {
            PushPlatform::Ios => "ios",
            PushPlatform::Android => "android",
        });
        let result = sqlx::query(
            r#"
            INSERT INTO registrations (
                extension_id, contact, device_id, source_ip, source_port,
                transport, user_agent, expires_at, push_token, push_platform, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (extension_id, contact) DO UPDATE SET
                device_id = excluded.device_id,
                source_ip = excluded.source_ip,
                source_port = excluded.source_port,
                transport = excluded.transport,
                user_agent = excluded.user_agent,
                expires_at = excluded.expires_at,
                push_token = excluded.push_token,
                push_platform = excluded.push_platform
            "#,
        )
        .bind(registration.extension_id)
        .bind(&registration.contact)
        .bind(&registration.device_id)
        .bind(&registration.source_ip)
        .bind(registration.source_port as i64)
        .bind(registration.transport.as_str())
        .bind(&registration.user_agent)
        .bind(registration.expires_at)
        .bind(&registration.push_token)
        .bind(platform)
        .bind(registration.created_at)
        .execute(&self.pool)
        .await?;

        let mut stored = registration.clone();
        if result.last_insert_rowid() > 0 {
            stored.id = result.last_insert_rowid();
        }
        Ok(stored)
    }

    async fn delete(&self, extension_id: i64, contact: &str) -> Result<()> {
        sqlx::query("DELETE FROM registrations WHERE extension_id = ? AND contact = ?")
            .bind(extension_id)
            .bind(contact)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_all(&self, extension_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM registrations WHERE extension_id = ?")
            .bind(extension_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_for_extension(&self, extension_id: i64) -> Result<Vec<Registration>> {
        let rows = sqlx::query(
            "SELECT * FROM registrations WHERE extension_id = ? AND expires_at > ? ORDER BY created_at",
        )
        .bind(extension_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    async fn all_for_extension(&self, extension_id: i64) -> Result<Vec<Registration>> {
        let rows =
            sqlx::query("SELECT * FROM registrations WHERE extension_id = ? ORDER BY created_at")
                .bind(extension_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(map_row).collect()
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM registrations WHERE expires_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn push_targets(&self, extension_id: i64) -> Result<Vec<Registration>> {
        let rows = sqlx::query(
            "SELECT * FROM registrations WHERE extension_id = ? AND push_token IS NOT NULL",
        )
        .bind(extension_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }
}
