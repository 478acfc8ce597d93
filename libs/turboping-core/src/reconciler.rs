//! Payment Reconciler: turns a [`PaymentNotification`] from any rail into
//! exactly one state transition on the payer's subscription.
//!
//! The whole decision runs inside one ledger transaction holding the
//! payer's row lock. The external reference is the idempotency key: a
//! second notification with the same reference finds the payment already
//! `completed` and returns [`ReconciliationOutcome::Duplicate`] without
//! touching anything. Lost races (unique violations, serialization
//! failures) abort the transaction and are retried a bounded number of
//! times before failing closed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use turboping_db::models::{
    NewPayment, NewSubscription, Payment, PaymentMethod, PaymentStatus, SubscriptionPlan,
    SubscriptionStatus,
};
use turboping_db::{Ledger, LedgerTx};

use crate::commission::CommissionCalculator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::LifecycleEvent;
use crate::notification::{PaymentNotification, ReconciliationOutcome};

/// What to do with the transaction once an outcome is known.
enum Decision {
    Commit(ReconciliationOutcome),
    Discard(ReconciliationOutcome),
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    config: Arc<EngineConfig>,
    commission: CommissionCalculator,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn Ledger>, config: Arc<EngineConfig>) -> Self {
        let commission = CommissionCalculator::new(ledger.clone(), config.clone());
        Self {
            ledger,
            config,
            commission,
        }
    }

    pub async fn reconcile(
        &self,
        notification: &PaymentNotification,
    ) -> EngineResult<ReconciliationOutcome> {
        self.reconcile_at(notification, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        notification: &PaymentNotification,
        now: DateTime<Utc>,
    ) -> EngineResult<ReconciliationOutcome> {
        let rail = validate(notification)?;
        let user = self
            .ledger
            .user_by_telegram_id(notification.telegram_id)
            .await?
            .ok_or(EngineError::UnknownUser(notification.telegram_id))?;

        let attempts = self.config.reconcile_attempts();
        for attempt in 1..=attempts {
            match self.attempt(user.id, rail, notification, now).await {
                Ok(outcome) => {
                    info!(
                        "Reconciled {} notification {:?} for user {}: {} (payment {})",
                        rail,
                        notification.reference(),
                        user.id,
                        outcome.label(),
                        outcome.payment_id()
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        "Reconciliation conflict for user {} (attempt {}/{}): {}",
                        user.id, attempt, attempts, e
                    );
                }
                Err(e) => {
                    if matches!(e, EngineError::InvariantViolation(_)) {
                        error!("Reconciliation for user {} aborted: {}", user.id, e);
                    }
                    return Err(e);
                }
            }
        }

        error!(
            "Reconciliation of {:?} for user {} gave up after {} attempts",
            notification.reference(),
            user.id,
            attempts
        );
        Err(EngineError::ReconciliationFailed { attempts })
    }

    async fn attempt(
        &self,
        user_id: i64,
        rail: PaymentMethod,
        notification: &PaymentNotification,
        now: DateTime<Utc>,
    ) -> EngineResult<ReconciliationOutcome> {
        let mut tx = self.ledger.begin(user_id).await?;
        match self.decide(tx.as_mut(), rail, notification, now).await {
            Ok(Decision::Commit(outcome)) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Ok(Decision::Discard(outcome)) => {
                tx.rollback().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback for user {} failed: {}", user_id, rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn decide(
        &self,
        tx: &mut dyn LedgerTx,
        rail: PaymentMethod,
        notification: &PaymentNotification,
        now: DateTime<Utc>,
    ) -> EngineResult<Decision> {
        let mut payment = match self.resolve_intent(tx, rail, notification, now).await? {
            Ok(payment) => payment,
            Err(decision) => return Ok(decision),
        };

        let plan = match payment.plan_id {
            Some(plan_id) => tx.plan(plan_id).await?,
            None => None,
        };
        let Some(plan) = plan else {
            payment.status = PaymentStatus::Failed;
            tx.update_payment(&payment).await?;
            return Ok(Decision::Commit(ReconciliationOutcome::NoMatchingIntent {
                payment_id: payment.id,
            }));
        };

        let received = notification.amount;
        payment.amount = received;
        if (received - plan.price).abs() > self.config.amount_tolerance {
            warn!(
                "Payment {} amount {} does not match plan {} price {}",
                payment.id, received, plan.id, plan.price
            );
            payment.status = PaymentStatus::Failed;
            tx.update_payment(&payment).await?;
            return Ok(Decision::Commit(ReconciliationOutcome::AmountMismatch {
                payment_id: payment.id,
                expected: plan.price,
                received,
            }));
        }

        let prior_completed = tx.completed_payment_count().await?;
        let (subscription_id, new_end_date) = self.extend_or_create(tx, &plan, now).await?;

        payment.status = PaymentStatus::Completed;
        payment.completed_at = Some(now);
        payment.subscription_id = Some(subscription_id);
        tx.update_payment(&payment).await?;

        let mut commission = None;
        if self.commission.applies_after(prior_completed) {
            if let Some(referral) = tx.referral_for_referred().await? {
                let delta = self.commission.accrue(&referral, payment.amount);
                tx.add_commission(delta.referral_id, delta.amount, payment.id)
                    .await?;
                commission = Some(delta);
            }
        }

        Ok(Decision::Commit(ReconciliationOutcome::Completed {
            payment_id: payment.id,
            subscription_id,
            new_end_date,
            commission,
            events: vec![LifecycleEvent::SubscriptionExtended {
                user_id: tx.user().id,
                subscription_id,
                new_end_date,
            }],
        }))
    }

    /// Finds the pending payment this notification settles, creating one
    /// when needed. `Err` carries a final decision (duplicate, settled, no
    /// intent) that ends the reconciliation early.
    async fn resolve_intent(
        &self,
        tx: &mut dyn LedgerTx,
        rail: PaymentMethod,
        notification: &PaymentNotification,
        now: DateTime<Utc>,
    ) -> EngineResult<Result<Payment, Decision>> {
        let user_id = tx.user().id;
        let reference = notification.reference();

        if let Some(reference) = reference {
            if let Some(existing) = tx.payment_by_reference(reference).await? {
                if existing.user_id != user_id {
                    return Err(EngineError::InvalidNotification(format!(
                        "reference {reference} belongs to another user"
                    )));
                }
                if existing.payment_method != rail {
                    return Err(EngineError::InvalidNotification(format!(
                        "reference {reference} was issued on {}",
                        existing.payment_method
                    )));
                }
                return Ok(match existing.status {
                    PaymentStatus::Completed => {
                        Err(Decision::Discard(ReconciliationOutcome::Duplicate {
                            payment_id: existing.id,
                        }))
                    }
                    PaymentStatus::Failed | PaymentStatus::Cancelled => {
                        Err(Decision::Discard(ReconciliationOutcome::AlreadySettled {
                            payment_id: existing.id,
                            status: existing.status,
                        }))
                    }
                    PaymentStatus::Pending => Ok(with_notification(existing, notification)),
                });
            }
        }

        if let Some(mut intent) = tx.latest_pending_intent(rail).await? {
            intent.external_reference = reference.map(str::to_string);
            return Ok(Ok(with_notification(intent, notification)));
        }

        let hinted_plan = match notification.plan_id {
            Some(plan_id) => tx.plan(plan_id).await?.filter(|p| p.is_active && !p.is_trial),
            None => None,
        };
        let status = if hinted_plan.is_some() {
            PaymentStatus::Pending
        } else {
            PaymentStatus::Failed
        };

        let payment = tx
            .insert_payment(NewPayment {
                user_id,
                plan_id: hinted_plan.as_ref().map(|p| p.id),
                payment_method: rail,
                amount: notification.amount,
                currency: notification.currency.clone(),
                crypto_amount: notification.crypto_amount,
                external_reference: reference.map(str::to_string),
                status,
                payload: payload_of(notification),
                created_at: now,
            })
            .await?;

        if hinted_plan.is_none() {
            warn!(
                "No pending {} intent or plan for user {}; payment {} recorded as failed",
                rail, user_id, payment.id
            );
            return Ok(Err(Decision::Commit(
                ReconciliationOutcome::NoMatchingIntent {
                    payment_id: payment.id,
                },
            )));
        }
        Ok(Ok(payment))
    }

    /// Extends the user's live subscription from `max(now, end_date)` or
    /// starts a new one. Returns the subscription id and its new end date.
    async fn extend_or_create(
        &self,
        tx: &mut dyn LedgerTx,
        plan: &SubscriptionPlan,
        now: DateTime<Utc>,
    ) -> EngineResult<(i64, DateTime<Utc>)> {
        let user_id = tx.user().id;
        let mut live = tx.live_subscriptions().await?;
        if live.len() > 1 {
            return Err(EngineError::InvariantViolation(format!(
                "user {user_id} holds {} non-terminal subscriptions",
                live.len()
            )));
        }

        if let Some(mut subscription) = live.pop() {
            let base = subscription.end_date.max(now);
            subscription.end_date = base + plan.duration();
            subscription.status = SubscriptionStatus::Active;
            subscription.plan_id = plan.id;
            subscription.last_reminder_days = None;
            subscription.updated_at = now;
            tx.update_subscription(&subscription).await?;
            return Ok((subscription.id, subscription.end_date));
        }

        let subscription = tx
            .insert_subscription(NewSubscription {
                user_id,
                plan_id: plan.id,
                start_date: now,
                end_date: now + plan.duration(),
                status: SubscriptionStatus::Active,
                is_trial: false,
            })
            .await?;
        Ok((subscription.id, subscription.end_date))
    }
}

/// Rejects notifications that must never be persisted.
fn validate(notification: &PaymentNotification) -> EngineResult<PaymentMethod> {
    let rail: PaymentMethod = notification
        .rail
        .parse()
        .map_err(|_| EngineError::UnknownRail(notification.rail.clone()))?;

    if notification.amount <= rust_decimal::Decimal::ZERO {
        return Err(EngineError::InvalidNotification(format!(
            "amount must be positive, got {}",
            notification.amount
        )));
    }
    // The reference is the idempotency key; without it a redelivery would
    // credit again.
    if notification.reference().is_none() {
        return Err(EngineError::InvalidNotification(format!(
            "{rail} notifications must carry an external reference"
        )));
    }
    Ok(rail)
}

fn with_notification(mut payment: Payment, notification: &PaymentNotification) -> Payment {
    if notification.currency.is_some() {
        payment.currency = notification.currency.clone();
    }
    if notification.crypto_amount.is_some() {
        payment.crypto_amount = notification.crypto_amount;
    }
    if let Some(payload) = payload_of(notification) {
        payment.payload = Some(payload);
    }
    payment
}

fn payload_of(notification: &PaymentNotification) -> Option<serde_json::Value> {
    (!notification.payload.is_null()).then(|| notification.payload.clone())
}
