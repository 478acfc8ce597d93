use sqlx::PgPool;

use crate::error::LedgerResult;
use crate::models::Payment;

pub(crate) const PAYMENT_COLUMNS: &str = "id, user_id, subscription_id, plan_id, payment_method, amount, \
     currency, crypto_amount, external_reference, status, payload, created_at, completed_at";

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> LedgerResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    pub async fn get_all_by_user(&self, user_id: i64) -> LedgerResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE user_id = $1 ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }
}
