use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;
use turboping_db::Ledger;
use turboping_db::models::{NewReferralPayout, PayoutStatus, ReferralPayout};

use crate::commission::{eligible_amount, unpaid_total};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Withdrawal requests against accrued referral commission.
#[derive(Clone)]
pub struct PayoutService {
    ledger: Arc<dyn Ledger>,
    config: Arc<EngineConfig>,
}

impl PayoutService {
    pub fn new(ledger: Arc<dyn Ledger>, config: Arc<EngineConfig>) -> Self {
        Self { ledger, config }
    }

    /// Snapshots everything currently eligible into a `requested` payout.
    /// A user may have only one open payout at a time.
    pub async fn request(
        &self,
        user_id: i64,
        payout_method: Option<String>,
        payout_address: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<ReferralPayout> {
        let mut tx = self.ledger.begin(user_id).await?;

        if tx.open_payout().await?.is_some() {
            tx.rollback().await?;
            return Err(EngineError::PayoutAlreadyOpen(user_id));
        }

        let referrals = tx.referrals_as_referrer().await?;
        let amount = eligible_amount(&referrals, &[], self.config.minimum_payout);
        if amount <= Decimal::ZERO {
            tx.rollback().await?;
            return Err(EngineError::BelowMinimumPayout {
                available: unpaid_total(&referrals),
                minimum: self.config.minimum_payout,
            });
        }

        let payout = tx
            .insert_payout(NewReferralPayout {
                user_id,
                amount,
                payout_method,
                payout_address,
                requested_at: now,
            })
            .await?;
        tx.commit().await?;

        info!("User {} requested payout {} of {}", user_id, payout.id, amount);
        Ok(payout)
    }

    /// Admin step along `requested -> processing -> completed|failed`.
    /// Completion settles the amount against the oldest unpaid commission
    /// first, in the same transaction.
    pub async fn advance(
        &self,
        payout_id: i64,
        next: PayoutStatus,
        admin_notes: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<ReferralPayout> {
        let payout = self.ledger.payout(payout_id).await?.ok_or(EngineError::NotFound {
            entity: "payout",
            id: payout_id,
        })?;

        let mut tx = self.ledger.begin(payout.user_id).await?;
        let Some(mut payout) = tx.payout(payout_id).await? else {
            tx.rollback().await?;
            return Err(EngineError::NotFound {
                entity: "payout",
                id: payout_id,
            });
        };

        if !payout.status.can_advance_to(next) {
            tx.rollback().await?;
            return Err(EngineError::InvalidTransition {
                entity: "payout",
                id: payout_id,
                from: payout.status.to_string(),
                to: next.to_string(),
            });
        }

        payout.status = next;
        if admin_notes.is_some() {
            payout.admin_notes = admin_notes;
        }
        match next {
            PayoutStatus::Processing => payout.processed_at = Some(now),
            PayoutStatus::Completed | PayoutStatus::Failed => payout.completed_at = Some(now),
            PayoutStatus::Requested => {}
        }

        if next == PayoutStatus::Completed {
            let mut remaining = payout.amount;
            for referral in tx.referrals_as_referrer().await? {
                if remaining <= Decimal::ZERO {
                    break;
                }
                let take = referral.unpaid().min(remaining);
                if take > Decimal::ZERO {
                    tx.settle_commission(referral.id, take, now).await?;
                    remaining -= take;
                }
            }
            if remaining > Decimal::ZERO {
                tx.rollback().await?;
                return Err(EngineError::InvariantViolation(format!(
                    "payout {payout_id} exceeds unpaid commission by {remaining}"
                )));
            }
        }

        tx.update_payout(&payout).await?;
        tx.commit().await?;

        info!("Payout {} is now {}", payout_id, payout.status);
        Ok(payout)
    }
}
