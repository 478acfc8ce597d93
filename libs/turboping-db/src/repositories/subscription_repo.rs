use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::LedgerResult;
use crate::models::Subscription;

pub(crate) const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, start_date, end_date, status, \
     is_trial, auto_renew, last_reminder_days, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: PgPool,
}

impl SubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> LedgerResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    pub async fn get_all_by_user(&self, user_id: i64) -> LedgerResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    pub async fn get_due(&self, horizon: DateTime<Utc>) -> LedgerResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE status IN ('trial', 'active', 'expiring_soon') AND end_date <= $1
             ORDER BY end_date, id"
        ))
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }
}
