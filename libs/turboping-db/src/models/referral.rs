use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Directed referrer -> referred edge, created once at the referred user's
/// first contact. Commission accrues on it as the referred user pays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Referral {
    pub id: i64,
    pub referrer_id: i64,
    pub referred_user_id: i64,
    pub commission_amount: Decimal,
    pub paid_amount: Decimal,
    pub commission_paid: bool,
    pub payment_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Referral {
    pub fn unpaid(&self) -> Decimal {
        (self.commission_amount - self.paid_amount).max(Decimal::ZERO)
    }
}
