use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ObserverLog {
    pub id: i64,
    pub task_type: String,
    pub user_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub status: String,
    pub message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewObserverLog {
    pub task_type: String,
    pub user_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub status: String,
    pub message: Option<String>,
    pub execution_time_ms: Option<i64>,
}
