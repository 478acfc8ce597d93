//! Subscription Lifecycle Manager.
//!
//! ```text
//! trial ─────────────┬──────────────> expired
//!   │ payment        │ end passed        ▲
//!   ▼                │                   │ end passed
//! active ──threshold──> expiring_soon ───┘
//!   ▲                      │
//!   └──────renewal─────────┘
//! any non-terminal ──admin/user──> cancelled
//! ```
//!
//! The sweep is safe to re-run: each subscription remembers the smallest
//! reminder offset already announced in `last_reminder_days`, so the same
//! or a later `now` never emits a reminder twice.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use turboping_db::Ledger;
use turboping_db::models::{NewSubscription, Subscription, SubscriptionStatus};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::LifecycleEvent;

/// Status change computed for one subscription at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: SubscriptionStatus,
    pub last_reminder_days: Option<i32>,
    /// Offset in days of the reminder to emit, if any.
    pub reminder: Option<i64>,
}

impl Transition {
    pub fn expires(&self) -> bool {
        self.status == SubscriptionStatus::Expired
    }
}

/// Next state of `subscription` at `now`, or `None` when nothing changes.
pub fn next_transition(
    subscription: &Subscription,
    now: DateTime<Utc>,
    reminder_offsets_days: &[i64],
) -> Option<Transition> {
    if subscription.status.is_terminal() {
        return None;
    }

    let left = subscription.end_date - now;
    if left <= Duration::zero() {
        return Some(Transition {
            status: SubscriptionStatus::Expired,
            last_reminder_days: subscription.last_reminder_days,
            reminder: None,
        });
    }

    // Trials expire silently; only paid subscriptions get reminders.
    if subscription.status == SubscriptionStatus::Trial {
        return None;
    }

    let crossed = reminder_offsets_days
        .iter()
        .copied()
        .filter(|days| left <= Duration::days(*days))
        .min();

    match crossed {
        Some(days) => {
            let announced = subscription
                .last_reminder_days
                .is_some_and(|last| i64::from(last) <= days);
            if announced && subscription.status == SubscriptionStatus::ExpiringSoon {
                return None;
            }
            Some(Transition {
                status: SubscriptionStatus::ExpiringSoon,
                last_reminder_days: if announced {
                    subscription.last_reminder_days
                } else {
                    i32::try_from(days).ok()
                },
                reminder: (!announced).then_some(days),
            })
        }
        None if subscription.status == SubscriptionStatus::ExpiringSoon => Some(Transition {
            status: SubscriptionStatus::Active,
            last_reminder_days: None,
            reminder: None,
        }),
        None => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedTransition {
    pub subscription_id: i64,
    pub user_id: i64,
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub subscription_id: i64,
    pub user_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub transitions: Vec<AppliedTransition>,
    pub events: Vec<LifecycleEvent>,
    pub failures: Vec<SweepFailure>,
    pub duration_ms: i64,
}

impl SweepReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn expired(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.to == SubscriptionStatus::Expired)
            .count()
    }

    pub fn reminders(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::ReminderDue { .. }))
            .count()
    }
}

#[derive(Clone)]
pub struct Lifecycle {
    ledger: Arc<dyn Ledger>,
    config: Arc<EngineConfig>,
}

impl Lifecycle {
    pub fn new(ledger: Arc<dyn Ledger>, config: Arc<EngineConfig>) -> Self {
        Self { ledger, config }
    }

    /// Advances every due subscription. A failure on one subscription is
    /// recorded in the report and the batch carries on; the next sweep picks
    /// it up again.
    pub async fn sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let started = Instant::now();
        let horizon = now + Duration::days(self.config.max_reminder_offset());
        let due = self.ledger.due_subscriptions(horizon).await?;

        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };

        for subscription in due {
            match self.advance(subscription.id, subscription.user_id, now).await {
                Ok(Some((applied, events))) => {
                    debug!(
                        "Subscription {} moved {} -> {}",
                        applied.subscription_id, applied.from, applied.to
                    );
                    report.transitions.push(applied);
                    report.events.extend(events);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Sweep failed for subscription {}: {}", subscription.id, e);
                    report.failures.push(SweepFailure {
                        subscription_id: subscription.id,
                        user_id: subscription.user_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        info!(
            "Sweep examined {} subscriptions: {} transitions, {} reminders, {} expired, {} failures",
            report.examined,
            report.transitions.len(),
            report.reminders(),
            report.expired(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn advance(
        &self,
        subscription_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<(AppliedTransition, Vec<LifecycleEvent>)>> {
        let mut tx = self.ledger.begin(user_id).await?;

        // Re-read under the lock: a payment may have extended it meanwhile.
        let Some(mut subscription) = tx.subscription(subscription_id).await? else {
            tx.rollback().await?;
            return Err(EngineError::NotFound {
                entity: "subscription",
                id: subscription_id,
            });
        };
        let Some(transition) =
            next_transition(&subscription, now, &self.config.reminder_offsets_days)
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let from = subscription.status;
        subscription.status = transition.status;
        subscription.last_reminder_days = transition.last_reminder_days;
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;

        let mut events = Vec::new();
        if let Some(days) = transition.reminder {
            events.push(LifecycleEvent::ReminderDue {
                user_id,
                subscription_id,
                days_before_expiry: days,
                end_date: subscription.end_date,
            });
        }
        if transition.expires() {
            let region = tx.user().region.clone();
            let revoked = tx.revoke_credentials(None, now).await?;
            debug!("Revoked {} credentials of user {}", revoked, user_id);
            events.push(LifecycleEvent::CredentialsRevoke { user_id, region });
        }

        tx.commit().await?;
        Ok(Some((
            AppliedTransition {
                subscription_id,
                user_id,
                from,
                to: subscription.status,
            },
            events,
        )))
    }

    /// Grants a trial from the active trial plan. Never while a subscription
    /// is live; once per user unless the config allows repeats.
    pub async fn grant_trial(&self, user_id: i64, now: DateTime<Utc>) -> EngineResult<Subscription> {
        self.start_trial(user_id, None, self.config.trial_once_per_user, now)
            .await
    }

    /// Operator-granted trial of `days` days. Ignores the once-per-user
    /// rule but still refuses while a subscription is live.
    pub async fn grant_trial_days(
        &self,
        user_id: i64,
        days: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<Subscription> {
        positive_days(days)?;
        self.start_trial(user_id, Some(days), false, now).await
    }

    async fn start_trial(
        &self,
        user_id: i64,
        days: Option<i64>,
        once_per_user: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<Subscription> {
        let mut tx = self.ledger.begin(user_id).await?;
        if !tx.user().is_active {
            tx.rollback().await?;
            return Err(EngineError::UserDeactivated(user_id));
        }

        let used_trial = once_per_user && tx.has_had_trial().await?;
        if used_trial || !tx.live_subscriptions().await?.is_empty() {
            tx.rollback().await?;
            return Err(EngineError::AlreadyHasSubscription(user_id));
        }
        let Some(plan) = tx.trial_plan().await? else {
            tx.rollback().await?;
            return Err(EngineError::NoTrialPlan);
        };

        let length = days.map_or_else(|| plan.duration(), Duration::days);
        let subscription = tx
            .insert_subscription(NewSubscription {
                user_id,
                plan_id: plan.id,
                start_date: now,
                end_date: now + length,
                status: SubscriptionStatus::Trial,
                is_trial: true,
            })
            .await?;
        tx.commit().await?;

        info!(
            "Granted {}-day trial to user {} (subscription {})",
            length.num_days(),
            user_id,
            subscription.id
        );
        Ok(subscription)
    }

    /// Manual extension by an operator: adds `days` to the live subscription
    /// from `max(now, end_date)`. A warned subscription goes back to active
    /// and its reminders start over; a trial stays a trial.
    pub async fn extend(
        &self,
        user_id: i64,
        days: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<(Subscription, Vec<LifecycleEvent>)> {
        positive_days(days)?;
        let mut tx = self.ledger.begin(user_id).await?;

        let mut live = tx.live_subscriptions().await?;
        if live.len() > 1 {
            tx.rollback().await?;
            return Err(EngineError::InvariantViolation(format!(
                "user {user_id} holds {} non-terminal subscriptions",
                live.len()
            )));
        }
        let Some(mut subscription) = live.pop() else {
            tx.rollback().await?;
            return Err(EngineError::NoLiveSubscription(user_id));
        };

        subscription.end_date = subscription.end_date.max(now) + Duration::days(days);
        if subscription.status == SubscriptionStatus::ExpiringSoon {
            subscription.status = SubscriptionStatus::Active;
        }
        subscription.last_reminder_days = None;
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;
        tx.commit().await?;

        info!(
            "Extended subscription {} of user {} by {} days to {}",
            subscription.id, user_id, days, subscription.end_date
        );
        let events = vec![LifecycleEvent::SubscriptionExtended {
            user_id,
            subscription_id: subscription.id,
            new_end_date: subscription.end_date,
        }];
        Ok((subscription, events))
    }

    /// Explicit cancellation by an admin or the user. Revokes access in the
    /// same transaction.
    pub async fn cancel(
        &self,
        subscription_id: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<(Subscription, Vec<LifecycleEvent>)> {
        let subscription = self
            .ledger
            .subscription(subscription_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "subscription",
                id: subscription_id,
            })?;

        let mut tx = self.ledger.begin(subscription.user_id).await?;
        let Some(mut subscription) = tx.subscription(subscription_id).await? else {
            tx.rollback().await?;
            return Err(EngineError::NotFound {
                entity: "subscription",
                id: subscription_id,
            });
        };
        if subscription.status.is_terminal() {
            tx.rollback().await?;
            return Err(EngineError::InvalidTransition {
                entity: "subscription",
                id: subscription_id,
                from: subscription.status.to_string(),
                to: SubscriptionStatus::Cancelled.to_string(),
            });
        }

        subscription.status = SubscriptionStatus::Cancelled;
        subscription.updated_at = now;
        tx.update_subscription(&subscription).await?;
        let region = tx.user().region.clone();
        tx.revoke_credentials(None, now).await?;
        tx.commit().await?;

        info!("Subscription {} cancelled", subscription_id);
        let events = vec![LifecycleEvent::CredentialsRevoke {
            user_id: subscription.user_id,
            region,
        }];
        Ok((subscription, events))
    }
}

fn positive_days(days: i64) -> EngineResult<()> {
    if days <= 0 {
        return Err(EngineError::InvalidRequest(format!(
            "days must be positive, got {days}"
        )));
    }
    Ok(())
}
