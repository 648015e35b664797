//! SQLite trunk repository

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::trunk::{Trunk, TrunkRepository, TrunkTransport, TrunkType};
use crate::{DomainError, Result};

pub struct SqliteTrunkRepository {
    pool: SqlitePool,
}

impl SqliteTrunkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_row(row: &SqliteRow) -> Result<Trunk> {
    let allowed_hosts: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("allowed_hosts")?).unwrap_or_default();
    let codecs: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("codecs")?).unwrap_or_default();
    Ok(Trunk {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        trunk_type: TrunkType::from_str(&row.try_get::<String, _>("trunk_type")?)
            .ok_or_else(|| DomainError::Storage("unknown trunk type".into()))?,
        host: row.try_get("host")?,
        port: row.try_get::<i64, _>("port")? as u16,
        transport: TrunkTransport::from_str(&row.try_get::<String, _>("transport")?)
            .unwrap_or(TrunkTransport::Udp),
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        auth_username: row.try_get("auth_username")?,
        register_expiry_secs: row.try_get::<i64, _>("register_expiry_secs")? as u32,
        allowed_hosts,
        codecs,
        max_channels: row.try_get::<i64, _>("max_channels")? as u32,
        caller_id_name: row.try_get("caller_id_name")?,
        caller_id_number: row.try_get("caller_id_number")?,
        strip_prefix: row.try_get("strip_prefix")?,
        add_prefix: row.try_get("add_prefix")?,
        priority: row.try_get::<i64, _>("priority")? as u32,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait::async_trait]
impl TrunkRepository for SqliteTrunkRepository {
    async fn create(&self, trunk: &Trunk) -> Result<Trunk> {
        let allowed_hosts = serde_json::to_string(&trunk.allowed_hosts)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        let codecs = serde_json::to_string(&trunk.codecs)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO trunks (
                name, trunk_type, host, port, transport, username, password,
                auth_username, register_expiry_secs, allowed_hosts, codecs,
                max_channels, caller_id_name, caller_id_number, strip_prefix,
                add_prefix, priority, enabled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trunk.name)
        .bind(trunk.trunk_type.as_str())
        .bind(&trunk.host)
        .bind(trunk.port as i64)
        .bind(trunk.transport.as_str())
        .bind(&trunk.username)
        .bind(&trunk.password)
        .bind(&trunk.auth_username)
        .bind(trunk.register_expiry_secs as i64)
        .bind(&allowed_hosts)
        .bind(&codecs)
        .bind(trunk.max_channels as i64)
        .bind(&trunk.caller_id_name)
        .bind(&trunk.caller_id_number)
        .bind(&trunk.strip_prefix)
        .bind(&trunk.add_prefix)
        .bind(trunk.priority as i64)
        .bind(trunk.enabled as i64)
        .bind(trunk.created_at)
        .bind(trunk.updated_at)
        .execute(&self.pool)
        .await?;

        let mut created = trunk.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update(&self, trunk: &Trunk) -> Result<()> {
        let allowed_hosts = serde_json::to_string(&trunk.allowed_hosts)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        let codecs = serde_json::to_string(&trunk.codecs)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE trunks SET
                name = ?, trunk_type = ?, host = ?, port = ?, transport = ?,
                username = ?, password = ?, auth_username = ?,
                register_expiry_secs = ?, allowed_hosts = ?, codecs = ?,
                max_channels = ?, caller_id_name = ?, caller_id_number = ?,
                strip_prefix = ?, add_prefix = ?, priority = ?, enabled = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&trunk.name)
        .bind(trunk.trunk_type.as_str())
        .bind(&trunk.host)
        .bind(trunk.port as i64)
        .bind(trunk.transport.as_str())
        .bind(&trunk.username)
        .bind(&trunk.password)
        .bind(&trunk.auth_username)
        .bind(trunk.register_expiry_secs as i64)
        .bind(&allowed_hosts)
        .bind(&codecs)
        .bind(trunk.max_channels as i64)
        .bind(&trunk.caller_id_name)
        .bind(&trunk.caller_id_number)
        .bind(&trunk.strip_prefix)
        .bind(&trunk.add_prefix)
        .bind(trunk.priority as i64)
        .bind(trunk.enabled as i64)
        .bind(Utc::now())
        .bind(trunk.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM trunks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<Trunk>> {
        let row = sqlx::query("SELECT * FROM trunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn list(&self, enabled_only: bool) -> Result<Vec<Trunk>> {
        let rows = if enabled_only {
            sqlx::query("SELECT * FROM trunks WHERE enabled = 1 ORDER BY priority, id")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM trunks ORDER BY priority, id")
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(map_row).collect()
    }
}
