use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Catalog entry. Rows referenced by a subscription are never repriced; a new
/// price means a new plan row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionPlan {
    pub id: i64,
    pub name: String,
    pub duration_days: i32,
    pub price: Decimal,
    pub is_trial: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionPlan {
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.duration_days))
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscriptionPlan {
    pub name: String,
    pub duration_days: i32,
    pub price: Decimal,
    pub is_trial: bool,
}
