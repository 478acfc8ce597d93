use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use turboping_db::Ledger;
use turboping_db::models::{Referral, ReferralPayout};

use crate::config::{CommissionPolicy, EngineConfig};
use crate::error::EngineResult;

/// Commission owed to a referrer for one payment. Persisted by the caller in
/// the same transaction as the payment that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommissionDelta {
    pub referral_id: i64,
    pub referrer_id: i64,
    pub amount: Decimal,
}

#[derive(Clone)]
pub struct CommissionCalculator {
    ledger: Arc<dyn Ledger>,
    config: Arc<EngineConfig>,
}

impl CommissionCalculator {
    pub fn new(ledger: Arc<dyn Ledger>, config: Arc<EngineConfig>) -> Self {
        Self { ledger, config }
    }

    /// `payment_amount * commission_percent / 100`, unrounded.
    pub fn accrue(&self, referral: &Referral, payment_amount: Decimal) -> CommissionDelta {
        CommissionDelta {
            referral_id: referral.id,
            referrer_id: referral.referrer_id,
            amount: payment_amount * self.config.commission_percent / Decimal::ONE_HUNDRED,
        }
    }

    /// Whether a payment earns commission given how many completed payments
    /// the referred user had before it.
    pub fn applies_after(&self, prior_completed_payments: i64) -> bool {
        match self.config.commission_policy {
            CommissionPolicy::FirstPayment => prior_completed_payments == 0,
            CommissionPolicy::EveryPayment => true,
        }
    }

    /// Unpaid commission across the user's referrals, minus what open payout
    /// requests already claim. Zero below the configured minimum.
    pub async fn eligible_payout(&self, user_id: i64) -> EngineResult<Decimal> {
        let referrals = self.ledger.referrals_by_referrer(user_id).await?;
        let payouts = self.ledger.payouts_for_user(user_id).await?;
        Ok(eligible_amount(&referrals, &payouts, self.config.minimum_payout))
    }

    pub fn minimum_payout(&self) -> Decimal {
        self.config.minimum_payout
    }
}

pub fn unpaid_total(referrals: &[Referral]) -> Decimal {
    referrals.iter().map(Referral::unpaid).sum()
}

pub fn eligible_amount(
    referrals: &[Referral],
    payouts: &[ReferralPayout],
    minimum: Decimal,
) -> Decimal {
    let claimed: Decimal = payouts
        .iter()
        .filter(|p| p.status.is_open())
        .map(|p| p.amount)
        .sum();
    let available = (unpaid_total(referrals) - claimed).max(Decimal::ZERO);
    if available < minimum {
        Decimal::ZERO
    } else {
        available
    }
}
