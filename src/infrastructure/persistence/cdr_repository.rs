//! SQLite CDR repository

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::cdr::{CallDirection, CallRecord, CdrFilters, CdrRepository, Disposition};
use crate::{DomainError, Result};

pub struct SqliteCdrRepository {
    pool: SqlitePool,
}

impl SqliteCdrRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_row(row: &SqliteRow) -> Result<CallRecord> {
    let flow_path: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("flow_path")?).unwrap_or_default();
    Ok(CallRecord {
        id: row.try_get("id")?,
        call_id: row.try_get("call_id")?,
        direction: CallDirection::from_str(&row.try_get::<String, _>("direction")?)
            .ok_or_else(|| DomainError::Storage("unknown call direction".into()))?,
        caller_id_name: row.try_get("caller_id_name")?,
        caller_id_number: row.try_get("caller_id_number")?,
        callee: row.try_get("callee")?,
        trunk_id: row.try_get("trunk_id")?,
        start_time: row.try_get::<DateTime<Utc>, _>("start_time")?,
        answer_time: row.try_get::<Option<DateTime<Utc>>, _>("answer_time")?,
        end_time: row.try_get::<Option<DateTime<Utc>>, _>("end_time")?,
        duration_secs: row.try_get("duration_secs")?,
        billable_secs: row.try_get("billable_secs")?,
        disposition: Disposition::from_str(&row.try_get::<String, _>("disposition")?)
            .unwrap_or(Disposition::Failed),
        hangup_cause: row.try_get("hangup_cause")?,
        recording_file: row.try_get("recording_file")?,
        flow_path,
    })
}

#[async_trait::async_trait]
impl CdrRepository for SqliteCdrRepository {
    async fn create(&self, record: &CallRecord) -> Result<CallRecord> {
        let flow_path = serde_json::to_string(&record.flow_path)
            .map_err(|e| DomainError::Internal(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO call_records (
                call_id, direction, caller_id_name, caller_id_number, callee,
                trunk_id, start_time, answer_time, end_time, duration_secs,
                billable_secs, disposition, hangup_cause, recording_file, flow_path
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.call_id)
        .bind(record.direction.as_str())
        .bind(&record.caller_id_name)
        .bind(&record.caller_id_number)
        .bind(&record.callee)
        .bind(record.trunk_id)
        .bind(record.start_time)
        .bind(record.answer_time)
        .bind(record.end_time)
        .bind(record.duration_secs)
        .bind(record.billable_secs)
        .bind(record.disposition.as_str())
        .bind(&record.hangup_cause)
        .bind(&record.recording_file)
        .bind(&flow_path)
        .execute(&self.pool)
        .await?;

        let mut created = record.clone();
        created.id = result.last_insert_rowid();
        debug!(call_id = %created.call_id, "CDR stored");
        Ok(created)
    }

    async fn get_by_call_id(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let row = sqlx::query("SELECT * FROM call_records WHERE call_id = ? ORDER BY id DESC LIMIT 1")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    async fn list(
        &self,
        filters: CdrFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CallRecord>> {
        let mut sql = String::from("SELECT * FROM call_records WHERE 1=1");
        if filters.direction.is_some() {
            sql.push_str(" AND direction = ?");
        }
        if filters.disposition.is_some() {
            sql.push_str(" AND disposition = ?");
        }
        if filters.start_from.is_some() {
            sql.push_str(" AND start_time >= ?");
        }
        if filters.start_to.is_some() {
            sql.push_str(" AND start_time < ?");
        }
        sql.push_str(" ORDER BY start_time DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(direction) = filters.direction {
            query = query.bind(direction.as_str());
        }
        if let Some(disposition) = filters.disposition {
            query = query.bind(disposition.as_str());
        }
        if let Some(from) = filters.start_from {
            query = query.bind(from);
        }
        if let Some(to) = filters.start_to {
            query = query.bind(to);
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        rows.iter().map(map_row).collect()
    }

    async fn count_by_direction(&self, direction: CallDirection) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM call_records WHERE direction = ?")
                .bind(direction.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::test_pool;

    fn record(call_id: &str, direction: CallDirection) -> CallRecord {
        let mut record = CallRecord::new(
            call_id.into(),
            direction,
            Some("Alice".into()),
            "0400000000".into(),
            "5551000".into(),
            Some(1),
        );
        record.push_flow_node("n1");
        record.push_flow_node("n2");
        record.mark_answered();
        record.mark_ended(Disposition::Answered, None);
        record
    }

    #[tokio::test]
    async fn test_create_and_fetch_preserves_flow_path() {
        let pool = test_pool().await;
        let repo = SqliteCdrRepository::new(pool);

        let created = repo
            .create(&record("call-1", CallDirection::Inbound))
            .await
            .unwrap();
        assert!(created.id > 0);

        let fetched = repo.get_by_call_id("call-1").await.unwrap().unwrap();
        assert_eq!(fetched.flow_path, vec!["n1", "n2"]);
        assert_eq!(fetched.disposition, Disposition::Answered);
        let (start, answer, end) = (
            fetched.start_time,
            fetched.answer_time.unwrap(),
            fetched.end_time.unwrap(),
        );
        assert!(start <= answer && answer <= end);
    }

    #[tokio::test]
    async fn test_count_by_direction() {
        let pool = test_pool().await;
        let repo = SqliteCdrRepository::new(pool);
        repo.create(&record("c1", CallDirection::Inbound)).await.unwrap();
        repo.create(&record("c2", CallDirection::Inbound)).await.unwrap();
        repo.create(&record("c3", CallDirection::Internal)).await.unwrap();

        assert_eq!(
            repo.count_by_direction(CallDirection::Inbound).await.unwrap(),
            2
        );
        assert_eq!(
            repo.count_by_direction(CallDirection::Internal).await.unwrap(),
            1
        );
        assert_eq!(
            repo.count_by_direction(CallDirection::Outbound).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_list_with_filters() {
        let pool = test_pool().await;
        let repo = SqliteCdrRepository::new(pool);
        repo.create(&record("c1", CallDirection::Inbound)).await.unwrap();
        repo.create(&record("c2", CallDirection::Internal)).await.unwrap();

        let filters = CdrFilters {
            direction: Some(CallDirection::Inbound),
            ..CdrFilters::default()
        };
        let rows = repo.list(filters, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call_id, "c1");

        let all = repo.list(CdrFilters::default(), 1, 0).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
