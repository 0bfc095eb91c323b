//! SQLite-based delivery recorder.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::recorder::{AttemptStatus, DeliveryId, DeliveryStatus, Recorder};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connect_deliveries (
    id INTEGER PRIMARY KEY,
    pipeline_name TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    attempts INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS connect_attempts (
    id INTEGER PRIMARY KEY,
    delivery_id INTEGER NOT NULL REFERENCES connect_deliveries(id),
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_connect_deliveries_pipeline ON connect_deliveries(pipeline_name, started_at);
CREATE INDEX IF NOT EXISTS idx_connect_deliveries_status ON connect_deliveries(status);
CREATE INDEX IF NOT EXISTS idx_connect_attempts_delivery ON connect_attempts(delivery_id);
"#;

/// SQLite-backed journal of record deliveries.
#[derive(Clone)]
pub struct SqliteRecorder {
    pool: SqlitePool,
}

impl SqliteRecorder {
    /// Create a new SQLite recorder with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Recorder for SqliteRecorder {
    async fn start_delivery(&self, pipeline_name: &str, entity_id: &str) -> anyhow::Result<DeliveryId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO connect_deliveries (pipeline_name, entity_id) VALUES (?, ?) RETURNING id",
        )
        .bind(pipeline_name)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(DeliveryId(id))
    }

    async fn record_attempt(
        &self,
        delivery_id: DeliveryId,
        attempt: u32,
        status: AttemptStatus,
    ) -> anyhow::Result<()> {
        let (status_str, error_msg) = match status {
            AttemptStatus::Succeeded => ("succeeded", None),
            AttemptStatus::Failed { error } => ("failed", Some(error)),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO connect_attempts (delivery_id, attempt, status, error_message) VALUES (?, ?, ?, ?)",
        )
        .bind(delivery_id.0)
        .bind(attempt as i64)
        .bind(status_str)
        .bind(error_msg)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE connect_deliveries SET attempts = ? WHERE id = ?")
            .bind(attempt as i64)
            .bind(delivery_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete_delivery(&self, delivery_id: DeliveryId, status: DeliveryStatus) -> anyhow::Result<()> {
        let (status_str, error_msg) = status.as_parts();

        sqlx::query(
            "UPDATE connect_deliveries SET completed_at = datetime('now'), status = ?, error_message = ? WHERE id = ?",
        )
        .bind(status_str)
        .bind(error_msg)
        .bind(delivery_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
