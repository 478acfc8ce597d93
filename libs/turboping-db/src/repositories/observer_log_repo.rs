use sqlx::PgPool;

use crate::error::LedgerResult;
use crate::models::{NewObserverLog, ObserverLog};

#[derive(Debug, Clone)]
pub struct ObserverLogRepository {
    pool: PgPool,
}

impl ObserverLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, entry: NewObserverLog) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO observer_logs (task_type, user_id, subscription_id, status, message, execution_time_ms)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&entry.task_type)
        .bind(entry.user_id)
        .bind(entry.subscription_id)
        .bind(&entry.status)
        .bind(&entry.message)
        .bind(entry.execution_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> LedgerResult<Vec<ObserverLog>> {
        let logs = sqlx::query_as::<_, ObserverLog>(
            "SELECT id, task_type, user_id, subscription_id, status, message, execution_time_ms, created_at
             FROM observer_logs ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}
