use sqlx::PgPool;

use crate::error::LedgerResult;
use crate::models::{Referral, ReferralPayout};

pub(crate) const REFERRAL_COLUMNS: &str = "id, referrer_id, referred_user_id, commission_amount, \
     paid_amount, commission_paid, payment_id, created_at, paid_at";

pub(crate) const PAYOUT_COLUMNS: &str = "id, user_id, amount, payout_method, payout_address, status, \
     admin_notes, requested_at, processed_at, completed_at";

/// Referral edges and the payout requests drawn against them.
#[derive(Debug, Clone)]
pub struct ReferralRepository {
    pool: PgPool,
}

impl ReferralRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_referrer(&self, referrer_id: i64) -> LedgerResult<Vec<Referral>> {
        let referrals = sqlx::query_as::<_, Referral>(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referrer_id = $1 ORDER BY created_at, id"
        ))
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(referrals)
    }

    pub async fn get_payout(&self, id: i64) -> LedgerResult<Option<ReferralPayout>> {
        let payout = sqlx::query_as::<_, ReferralPayout>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM referral_payouts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payout)
    }

    pub async fn get_payouts_by_user(&self, user_id: i64) -> LedgerResult<Vec<ReferralPayout>> {
        let payouts = sqlx::query_as::<_, ReferralPayout>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM referral_payouts WHERE user_id = $1 ORDER BY requested_at, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payouts)
    }
}
