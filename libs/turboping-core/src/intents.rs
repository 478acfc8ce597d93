use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use turboping_db::Ledger;
use turboping_db::models::{NewPayment, Payment, PaymentMethod, PaymentStatus};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Pending payments created by the bot before the user pays. The reconciler
/// later matches notifications against them.
#[derive(Clone)]
pub struct PaymentIntents {
    ledger: Arc<dyn Ledger>,
    config: Arc<EngineConfig>,
}

impl PaymentIntents {
    pub fn new(ledger: Arc<dyn Ledger>, config: Arc<EngineConfig>) -> Self {
        Self { ledger, config }
    }

    /// Records a pending payment for the plan price. `external_reference`
    /// is set when the provider hands out an id up front (a charge id).
    pub async fn create(
        &self,
        user_id: i64,
        plan_id: i64,
        rail: PaymentMethod,
        external_reference: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<Payment> {
        let mut tx = self.ledger.begin(user_id).await?;
        if !tx.user().is_active {
            tx.rollback().await?;
            return Err(EngineError::UserDeactivated(user_id));
        }

        let plan = tx
            .plan(plan_id)
            .await?
            .filter(|p| p.is_active && !p.is_trial);
        let Some(plan) = plan else {
            tx.rollback().await?;
            return Err(EngineError::UnknownPlan(plan_id));
        };

        let payment = tx
            .insert_payment(NewPayment {
                user_id,
                plan_id: Some(plan.id),
                payment_method: rail,
                amount: plan.price,
                currency: Some(self.config.reference_currency.clone()),
                crypto_amount: None,
                external_reference: external_reference
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty()),
                status: PaymentStatus::Pending,
                payload: None,
                created_at: now,
            })
            .await?;
        tx.commit().await?;

        info!(
            "Created {} intent {} for user {} on plan {} ({} {})",
            rail, payment.id, user_id, plan.id, plan.price, self.config.reference_currency
        );
        Ok(payment)
    }
}
