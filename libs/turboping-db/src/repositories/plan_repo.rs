use sqlx::PgPool;

use crate::error::LedgerResult;
use crate::models::{NewSubscriptionPlan, SubscriptionPlan};

pub(crate) const PLAN_COLUMNS: &str =
    "id, name, duration_days, price, is_trial, is_active, created_at";

#[derive(Debug, Clone)]
pub struct PlanRepository {
    pool: PgPool,
}

impl PlanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewSubscriptionPlan) -> LedgerResult<SubscriptionPlan> {
        let plan = sqlx::query_as::<_, SubscriptionPlan>(&format!(
            "INSERT INTO subscription_plans (name, duration_days, price, is_trial)
             VALUES ($1, $2, $3, $4)
             RETURNING {PLAN_COLUMNS}"
        ))
        .bind(&new.name)
        .bind(new.duration_days)
        .bind(new.price)
        .bind(new.is_trial)
        .fetch_one(&self.pool)
        .await?;
        Ok(plan)
    }

    pub async fn get_by_id(&self, id: i64) -> LedgerResult<Option<SubscriptionPlan>> {
        let plan = sqlx::query_as::<_, SubscriptionPlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    pub async fn get_active(&self) -> LedgerResult<Vec<SubscriptionPlan>> {
        let plans = sqlx::query_as::<_, SubscriptionPlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE is_active = TRUE ORDER BY duration_days, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }
}
