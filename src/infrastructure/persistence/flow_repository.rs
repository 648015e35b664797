//! SQLite flow repository - flows, versions and the published snapshot

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::domain::flow::{CallFlow, FlowRepository, FlowVersion};
use crate::{DomainError, Result};

pub struct SqliteFlowRepository {
    pool: SqlitePool,
}

impl SqliteFlowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_flow(row: &SqliteRow) -> Result<CallFlow> {
    Ok(CallFlow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn map_version(row: &SqliteRow) -> Result<FlowVersion> {
    Ok(FlowVersion {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        version: row.try_get("version")?,
        flow_data: row.try_get("flow_data")?,
        published: row.try_get::<i64, _>("published")? != 0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait::async_trait]
impl FlowRepository for SqliteFlowRepository {
    async fn create_flow(&self, name: &str) -> Result<CallFlow> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO call_flows (name, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(CallFlow {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn delete_flow(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM call_flows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_flow(&self, id: i64) -> Result<Option<CallFlow>> {
        let row = sqlx::query("SELECT * FROM call_flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_flow).transpose()
    }

    async fn list_flows(&self) -> Result<Vec<CallFlow>> {
        let rows = sqlx::query("SELECT * FROM call_flows ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_flow).collect()
    }

    async fn save_version(&self, flow_id: i64, flow_data: &str) -> Result<FlowVersion> {
        let mut tx = self.pool.begin().await?;
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM flow_versions WHERE flow_id = ?",
        )
        .bind(flow_id)
        .fetch_one(&mut *tx)
        .await?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO flow_versions (flow_id, version, flow_data, published, created_at) \
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(flow_id)
        .bind(next)
        .bind(flow_data)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(FlowVersion {
            id: result.last_insert_rowid(),
            flow_id,
            version: next,
            flow_data: flow_data.to_string(),
            published: false,
            created_at: now,
        })
    }

    async fn publish_version(&self, flow_id: i64, version_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE flow_versions SET published = 0 WHERE flow_id = ?")
            .bind(flow_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "UPDATE flow_versions SET published = 1 WHERE id = ? AND flow_id = ?",
        )
        .bind(version_id)
        .bind(flow_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound(format!(
                "version {} of flow {}",
                version_id, flow_id
            )));
        }
        sqlx::query("UPDATE call_flows SET updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(flow_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(flow_id, version_id, "flow version published");
        Ok(())
    }

    async fn get_published(&self, flow_id: i64) -> Result<Option<FlowVersion>> {
        let row = sqlx::query(
            "SELECT * FROM flow_versions WHERE flow_id = ? AND published = 1 LIMIT 1",
        )
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_version).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::test_pool;

    const GRAPH: &str = r#"{"entry":"n1","nodes":[{"id":"n1","type":"hangup","data":{}}],"edges":[]}"#;

    #[tokio::test]
    async fn test_versions_increment_and_publish_is_exclusive() {
        let pool = test_pool().await;
        let repo = SqliteFlowRepository::new(pool);

        let flow = repo.create_flow("main").await.unwrap();
        let v1 = repo.save_version(flow.id, GRAPH).await.unwrap();
        let v2 = repo.save_version(flow.id, GRAPH).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        assert!(repo.get_published(flow.id).await.unwrap().is_none());

        repo.publish_version(flow.id, v1.id).await.unwrap();
        let published = repo.get_published(flow.id).await.unwrap().unwrap();
        assert_eq!(published.id, v1.id);

        // publishing v2 unpublishes v1
        repo.publish_version(flow.id, v2.id).await.unwrap();
        let published = repo.get_published(flow.id).await.unwrap().unwrap();
        assert_eq!(published.id, v2.id);

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM flow_versions WHERE flow_id = ? AND published = 1",
        )
        .bind(flow.id)
        .fetch_one(&repo.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_publish_unknown_version_fails() {
        let pool = test_pool().await;
        let repo = SqliteFlowRepository::new(pool);
        let flow = repo.create_flow("main").await.unwrap();
        assert!(repo.publish_version(flow.id, 999).await.is_err());
    }

    #[tokio::test]
    async fn test_published_graph_parses() {
        let pool = test_pool().await;
        let repo = SqliteFlowRepository::new(pool);
        let flow = repo.create_flow("main").await.unwrap();
        let version = repo.save_version(flow.id, GRAPH).await.unwrap();
        repo.publish_version(flow.id, version.id).await.unwrap();

        let snapshot = repo.get_published(flow.id).await.unwrap().unwrap();
        let graph = snapshot.graph().unwrap();
        assert_eq!(graph.entry, "n1");
    }
}
