//! Database connection management

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::{DomainError, Result};

/// Open (and create if missing) the SQLite database behind `url`.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    info!("opening database {}", url);
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| DomainError::Storage(format!("bad database url: {}", e)))?
        .create_if_missing(true)
        .foreign_keys(true);

    // every pool connection to :memory: would get its own empty database,
    // and reaping the single connection would drop the data with it
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

/// Apply the ordered, idempotent schema steps under ./migrations and
/// record which have run.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| DomainError::Storage(format!("migration failed: {}", e)))?;
    info!("database migrations complete");
    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = connect("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_apply_to_fresh_database() {
        let pool = test_pool().await;
        // a second run must be a no-op
        run_migrations(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM extensions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
