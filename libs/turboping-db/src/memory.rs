//! In-process ledger with the same locking and uniqueness rules as the
//! Postgres backend. Writes are staged per transaction and only become
//! visible on `commit`. Used by the engine tests and by local runs without
//! a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{Ledger, LedgerTx};
use crate::models::{
    NewObserverLog, NewPayment, NewProxyCredential, NewReferralPayout, NewSubscription,
    NewSubscriptionPlan, NewUser, ObserverLog, Payment, PaymentMethod, PaymentStatus,
    ProxyCredential, Referral, ReferralPayout, Subscription, SubscriptionPlan, User,
};

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<i64, User>,
    plans: BTreeMap<i64, SubscriptionPlan>,
    subscriptions: BTreeMap<i64, Subscription>,
    payments: BTreeMap<i64, Payment>,
    referrals: BTreeMap<i64, Referral>,
    payouts: BTreeMap<i64, ReferralPayout>,
    credentials: BTreeMap<i64, ProxyCredential>,
    observer_logs: Vec<ObserverLog>,
}

#[derive(Debug, Default)]
struct Faults {
    conflicts: Vec<(Option<i64>, u32)>,
    unavailable_users: HashSet<i64>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    user_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    faults: Mutex<Faults>,
    next_id: AtomicI64,
}

#[derive(Debug, Clone)]
pub struct MemoryLedger {
    inner: Arc<Inner>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                user_locks: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    /// Makes the next `count` commits fail with [`LedgerError::Conflict`],
    /// only for `user_id` when given.
    pub async fn inject_conflicts(&self, user_id: Option<i64>, count: u32) {
        self.inner.faults.lock().await.conflicts.push((user_id, count));
    }

    /// Every `begin` for `user_id` fails as if the database were down.
    pub async fn make_unavailable(&self, user_id: i64) {
        self.inner.faults.lock().await.unavailable_users.insert(user_id);
    }

    pub async fn observer_logs(&self) -> Vec<ObserverLog> {
        self.inner.state.lock().await.observer_logs.clone()
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.inner.user_locks.lock().await;
        locks.entry(user_id).or_default().clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self, user_id: i64) -> LedgerResult<Box<dyn LedgerTx>> {
        if self.inner.faults.lock().await.unavailable_users.contains(&user_id) {
            return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
        }

        let guard = self.user_lock(user_id).await.lock_owned().await;
        let user = self
            .inner
            .state
            .lock()
            .await
            .users
            .get(&user_id)
            .cloned()
            .ok_or(LedgerError::UnknownUser(user_id))?;

        Ok(Box::new(MemoryLedgerTx {
            ledger: self.clone(),
            user,
            staged: Staged::default(),
            _guard: guard,
        }))
    }

    async fn create_user(&self, new: NewUser) -> LedgerResult<(User, bool)> {
        let mut state = self.inner.state.lock().await;

        if let Some(existing) = state.users.values().find(|u| u.telegram_id == new.telegram_id) {
            return Ok((existing.clone(), false));
        }
        if state.users.values().any(|u| u.referral_code == new.referral_code) {
            return Err(LedgerError::Conflict(format!(
                "referral code {} already taken",
                new.referral_code
            )));
        }
        if let Some(referrer_id) = new.referred_by_user_id {
            if !state.users.contains_key(&referrer_id) {
                return Err(LedgerError::UnknownUser(referrer_id));
            }
        }

        let now = Utc::now();
        let user = User {
            id: self.next_id(),
            telegram_id: new.telegram_id,
            username: new.username,
            first_name: new.first_name,
            language_code: new.language_code,
            referral_code: new.referral_code,
            referred_by_user_id: new.referred_by_user_id,
            region: new.region,
            is_active: true,
            is_admin: false,
            created_at: now,
        };
        state.users.insert(user.id, user.clone());

        if let Some(referrer_id) = user.referred_by_user_id {
            let referral = Referral {
                id: self.next_id(),
                referrer_id,
                referred_user_id: user.id,
                commission_amount: Decimal::ZERO,
                paid_amount: Decimal::ZERO,
                commission_paid: false,
                payment_id: None,
                created_at: now,
                paid_at: None,
            };
            state.referrals.insert(referral.id, referral);
        }

        Ok((user, true))
    }

    async fn user(&self, user_id: i64) -> LedgerResult<Option<User>> {
        Ok(self.inner.state.lock().await.users.get(&user_id).cloned())
    }

    async fn user_by_telegram_id(&self, telegram_id: i64) -> LedgerResult<Option<User>> {
        let state = self.inner.state.lock().await;
        Ok(state.users.values().find(|u| u.telegram_id == telegram_id).cloned())
    }

    async fn user_by_referral_code(&self, code: &str) -> LedgerResult<Option<User>> {
        let code = code.trim();
        let state = self.inner.state.lock().await;
        Ok(state.users.values().find(|u| u.referral_code == code).cloned())
    }

    async fn create_plan(&self, new: NewSubscriptionPlan) -> LedgerResult<SubscriptionPlan> {
        let plan = SubscriptionPlan {
            id: self.next_id(),
            name: new.name,
            duration_days: new.duration_days,
            price: new.price,
            is_trial: new.is_trial,
            is_active: true,
            created_at: Utc::now(),
        };
        self.inner.state.lock().await.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn plan(&self, plan_id: i64) -> LedgerResult<Option<SubscriptionPlan>> {
        Ok(self.inner.state.lock().await.plans.get(&plan_id).cloned())
    }

    async fn active_plans(&self) -> LedgerResult<Vec<SubscriptionPlan>> {
        let state = self.inner.state.lock().await;
        let mut plans: Vec<_> = state.plans.values().filter(|p| p.is_active).cloned().collect();
        plans.sort_by_key(|p| (p.duration_days, p.id));
        Ok(plans)
    }

    async fn subscription(&self, subscription_id: i64) -> LedgerResult<Option<Subscription>> {
        Ok(self.inner.state.lock().await.subscriptions.get(&subscription_id).cloned())
    }

    async fn subscriptions_for_user(&self, user_id: i64) -> LedgerResult<Vec<Subscription>> {
        let state = self.inner.state.lock().await;
        Ok(state.subscriptions.values().filter(|s| s.user_id == user_id).cloned().collect())
    }

    async fn due_subscriptions(&self, horizon: DateTime<Utc>) -> LedgerResult<Vec<Subscription>> {
        let state = self.inner.state.lock().await;
        let mut due: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.is_live() && s.end_date <= horizon)
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.end_date, s.id));
        Ok(due)
    }

    async fn payment(&self, payment_id: i64) -> LedgerResult<Option<Payment>> {
        Ok(self.inner.state.lock().await.payments.get(&payment_id).cloned())
    }

    async fn payments_for_user(&self, user_id: i64) -> LedgerResult<Vec<Payment>> {
        let state = self.inner.state.lock().await;
        Ok(state.payments.values().filter(|p| p.user_id == user_id).cloned().collect())
    }

    async fn referrals_by_referrer(&self, referrer_id: i64) -> LedgerResult<Vec<Referral>> {
        let state = self.inner.state.lock().await;
        Ok(state.referrals.values().filter(|r| r.referrer_id == referrer_id).cloned().collect())
    }

    async fn payout(&self, payout_id: i64) -> LedgerResult<Option<ReferralPayout>> {
        Ok(self.inner.state.lock().await.payouts.get(&payout_id).cloned())
    }

    async fn payouts_for_user(&self, user_id: i64) -> LedgerResult<Vec<ReferralPayout>> {
        let state = self.inner.state.lock().await;
        Ok(state.payouts.values().filter(|p| p.user_id == user_id).cloned().collect())
    }

    async fn active_credential(
        &self,
        user_id: i64,
        region: &str,
    ) -> LedgerResult<Option<ProxyCredential>> {
        let state = self.inner.state.lock().await;
        Ok(state
            .credentials
            .values()
            .find(|c| c.user_id == user_id && c.region == region && c.is_active())
            .cloned())
    }

    async fn record_observer_log(&self, entry: NewObserverLog) -> LedgerResult<()> {
        let log = ObserverLog {
            id: self.next_id(),
            task_type: entry.task_type,
            user_id: entry.user_id,
            subscription_id: entry.subscription_id,
            status: entry.status,
            message: entry.message,
            execution_time_ms: entry.execution_time_ms,
            created_at: Utc::now(),
        };
        self.inner.state.lock().await.observer_logs.push(log);
        Ok(())
    }
}

#[derive(Debug)]
enum CommissionOp {
    Accrue {
        referral_id: i64,
        amount: Decimal,
        payment_id: i64,
    },
    Settle {
        referral_id: i64,
        amount: Decimal,
        at: DateTime<Utc>,
    },
}

impl CommissionOp {
    fn referral_id(&self) -> i64 {
        match self {
            CommissionOp::Accrue { referral_id, .. } | CommissionOp::Settle { referral_id, .. } => {
                *referral_id
            }
        }
    }

    fn apply(&self, referral: &mut Referral) {
        match self {
            CommissionOp::Accrue {
                amount, payment_id, ..
            } => {
                referral.commission_amount += *amount;
                referral.payment_id.get_or_insert(*payment_id);
                referral.commission_paid = false;
            }
            CommissionOp::Settle { amount, at, .. } => {
                referral.paid_amount += *amount;
                referral.commission_paid = referral.paid_amount >= referral.commission_amount;
                referral.paid_at = Some(*at);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Staged {
    user: bool,
    payments: BTreeMap<i64, Payment>,
    subscriptions: BTreeMap<i64, Subscription>,
    payouts: BTreeMap<i64, ReferralPayout>,
    credentials: BTreeMap<i64, ProxyCredential>,
    commission_ops: Vec<CommissionOp>,
}

fn overlay<T: Clone>(base: &BTreeMap<i64, T>, staged: &BTreeMap<i64, T>) -> BTreeMap<i64, T> {
    let mut merged = base.clone();
    merged.extend(staged.iter().map(|(id, row)| (*id, row.clone())));
    merged
}

pub struct MemoryLedgerTx {
    ledger: MemoryLedger,
    user: User,
    staged: Staged,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryLedgerTx {
    async fn payments(&self) -> BTreeMap<i64, Payment> {
        let state = self.ledger.inner.state.lock().await;
        overlay(&state.payments, &self.staged.payments)
    }

    async fn subscriptions(&self) -> BTreeMap<i64, Subscription> {
        let state = self.ledger.inner.state.lock().await;
        overlay(&state.subscriptions, &self.staged.subscriptions)
    }

    async fn payouts(&self) -> BTreeMap<i64, ReferralPayout> {
        let state = self.ledger.inner.state.lock().await;
        overlay(&state.payouts, &self.staged.payouts)
    }

    async fn credentials(&self) -> BTreeMap<i64, ProxyCredential> {
        let state = self.ledger.inner.state.lock().await;
        overlay(&state.credentials, &self.staged.credentials)
    }

    async fn referrals(&self) -> BTreeMap<i64, Referral> {
        let mut referrals = self.ledger.inner.state.lock().await.referrals.clone();
        for op in &self.staged.commission_ops {
            if let Some(referral) = referrals.get_mut(&op.referral_id()) {
                op.apply(referral);
            }
        }
        referrals
    }

    async fn ensure_referral(&self, referral_id: i64) -> LedgerResult<()> {
        if self.ledger.inner.state.lock().await.referrals.contains_key(&referral_id) {
            Ok(())
        } else {
            Err(LedgerError::NotFound {
                entity: "referral",
                id: referral_id,
            })
        }
    }

    async fn take_injected_conflict(&self) -> bool {
        let mut faults = self.ledger.inner.faults.lock().await;
        let user_id = self.user.id;
        let slot = faults
            .conflicts
            .iter_mut()
            .find(|(target, left)| *left > 0 && target.is_none_or(|id| id == user_id));
        match slot {
            Some((_, left)) => {
                *left -= 1;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    fn user(&self) -> &User {
        &self.user
    }

    async fn update_user_region(&mut self, region: &str) -> LedgerResult<()> {
        self.user.region = region.to_string();
        self.staged.user = true;
        Ok(())
    }

    async fn set_user_active(&mut self, active: bool) -> LedgerResult<()> {
        self.user.is_active = active;
        self.staged.user = true;
        Ok(())
    }

    async fn plan(&mut self, plan_id: i64) -> LedgerResult<Option<SubscriptionPlan>> {
        Ok(self.ledger.inner.state.lock().await.plans.get(&plan_id).cloned())
    }

    async fn trial_plan(&mut self) -> LedgerResult<Option<SubscriptionPlan>> {
        let state = self.ledger.inner.state.lock().await;
        Ok(state.plans.values().find(|p| p.is_trial && p.is_active).cloned())
    }

    async fn payment_by_reference(&mut self, reference: &str) -> LedgerResult<Option<Payment>> {
        Ok(self
            .payments()
            .await
            .into_values()
            .find(|p| p.external_reference.as_deref() == Some(reference)))
    }

    async fn latest_pending_intent(
        &mut self,
        method: PaymentMethod,
    ) -> LedgerResult<Option<Payment>> {
        let user_id = self.user.id;
        Ok(self
            .payments()
            .await
            .into_values()
            .filter(|p| {
                p.user_id == user_id
                    && p.payment_method == method
                    && p.status == PaymentStatus::Pending
                    && p.external_reference.is_none()
            })
            .max_by_key(|p| (p.created_at, p.id)))
    }

    async fn completed_payment_count(&mut self) -> LedgerResult<i64> {
        let user_id = self.user.id;
        let count = self
            .payments()
            .await
            .values()
            .filter(|p| p.user_id == user_id && p.status == PaymentStatus::Completed)
            .count();
        Ok(count as i64)
    }

    async fn insert_payment(&mut self, new: NewPayment) -> LedgerResult<Payment> {
        let payment = Payment {
            id: self.ledger.next_id(),
            user_id: new.user_id,
            subscription_id: None,
            plan_id: new.plan_id,
            payment_method: new.payment_method,
            amount: new.amount,
            currency: new.currency,
            crypto_amount: new.crypto_amount,
            external_reference: new.external_reference,
            status: new.status,
            payload: new.payload,
            created_at: new.created_at,
            completed_at: None,
        };
        self.staged.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn update_payment(&mut self, payment: &Payment) -> LedgerResult<()> {
        if !self.payments().await.contains_key(&payment.id) {
            return Err(LedgerError::NotFound {
                entity: "payment",
                id: payment.id,
            });
        }
        self.staged.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn live_subscriptions(&mut self) -> LedgerResult<Vec<Subscription>> {
        let user_id = self.user.id;
        Ok(self
            .subscriptions()
            .await
            .into_values()
            .filter(|s| s.user_id == user_id && s.is_live())
            .collect())
    }

    async fn subscription(&mut self, subscription_id: i64) -> LedgerResult<Option<Subscription>> {
        let user_id = self.user.id;
        Ok(self
            .subscriptions()
            .await
            .remove(&subscription_id)
            .filter(|s| s.user_id == user_id))
    }

    async fn has_had_trial(&mut self) -> LedgerResult<bool> {
        let user_id = self.user.id;
        Ok(self
            .subscriptions()
            .await
            .values()
            .any(|s| s.user_id == user_id && s.is_trial))
    }

    async fn insert_subscription(&mut self, new: NewSubscription) -> LedgerResult<Subscription> {
        let sub = Subscription {
            id: self.ledger.next_id(),
            user_id: new.user_id,
            plan_id: new.plan_id,
            start_date: new.start_date,
            end_date: new.end_date,
            status: new.status,
            is_trial: new.is_trial,
            auto_renew: false,
            last_reminder_days: None,
            created_at: new.start_date,
            updated_at: new.start_date,
        };
        self.staged.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn update_subscription(&mut self, subscription: &Subscription) -> LedgerResult<()> {
        let owned = self
            .subscriptions()
            .await
            .get(&subscription.id)
            .is_some_and(|s| s.user_id == self.user.id);
        if !owned {
            return Err(LedgerError::NotFound {
                entity: "subscription",
                id: subscription.id,
            });
        }
        self.staged
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn referral_for_referred(&mut self) -> LedgerResult<Option<Referral>> {
        let user_id = self.user.id;
        Ok(self
            .referrals()
            .await
            .into_values()
            .find(|r| r.referred_user_id == user_id))
    }

    async fn referrals_as_referrer(&mut self) -> LedgerResult<Vec<Referral>> {
        let user_id = self.user.id;
        let mut referrals: Vec<_> = self
            .referrals()
            .await
            .into_values()
            .filter(|r| r.referrer_id == user_id)
            .collect();
        referrals.sort_by_key(|r| (r.created_at, r.id));
        Ok(referrals)
    }

    async fn add_commission(
        &mut self,
        referral_id: i64,
        amount: Decimal,
        payment_id: i64,
    ) -> LedgerResult<()> {
        self.ensure_referral(referral_id).await?;
        self.staged.commission_ops.push(CommissionOp::Accrue {
            referral_id,
            amount,
            payment_id,
        });
        Ok(())
    }

    async fn settle_commission(
        &mut self,
        referral_id: i64,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        self.ensure_referral(referral_id).await?;
        self.staged.commission_ops.push(CommissionOp::Settle {
            referral_id,
            amount,
            at,
        });
        Ok(())
    }

    async fn open_payout(&mut self) -> LedgerResult<Option<ReferralPayout>> {
        let user_id = self.user.id;
        Ok(self
            .payouts()
            .await
            .into_values()
            .filter(|p| p.user_id == user_id && p.status.is_open())
            .max_by_key(|p| (p.requested_at, p.id)))
    }

    async fn payout(&mut self, payout_id: i64) -> LedgerResult<Option<ReferralPayout>> {
        let user_id = self.user.id;
        Ok(self
            .payouts()
            .await
            .remove(&payout_id)
            .filter(|p| p.user_id == user_id))
    }

    async fn insert_payout(&mut self, new: NewReferralPayout) -> LedgerResult<ReferralPayout> {
        let payout = ReferralPayout {
            id: self.ledger.next_id(),
            user_id: new.user_id,
            amount: new.amount,
            payout_method: new.payout_method,
            payout_address: new.payout_address,
            status: crate::models::PayoutStatus::Requested,
            admin_notes: None,
            requested_at: new.requested_at,
            processed_at: None,
            completed_at: None,
        };
        self.staged.payouts.insert(payout.id, payout.clone());
        Ok(payout)
    }

    async fn update_payout(&mut self, payout: &ReferralPayout) -> LedgerResult<()> {
        let owned = self
            .payouts()
            .await
            .get(&payout.id)
            .is_some_and(|p| p.user_id == self.user.id);
        if !owned {
            return Err(LedgerError::NotFound {
                entity: "payout",
                id: payout.id,
            });
        }
        self.staged.payouts.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn active_credential(&mut self, region: &str) -> LedgerResult<Option<ProxyCredential>> {
        let user_id = self.user.id;
        Ok(self
            .credentials()
            .await
            .into_values()
            .find(|c| c.user_id == user_id && c.region == region && c.is_active()))
    }

    async fn insert_credential(
        &mut self,
        new: NewProxyCredential,
    ) -> LedgerResult<ProxyCredential> {
        let credential = ProxyCredential {
            id: self.ledger.next_id(),
            user_id: new.user_id,
            region: new.region,
            proxy_host: new.proxy_host,
            proxy_port: new.proxy_port,
            username_encrypted: new.username_encrypted,
            password_encrypted: new.password_encrypted,
            assigned_at: new.assigned_at,
            revoked_at: None,
        };
        self.staged.credentials.insert(credential.id, credential.clone());
        Ok(credential)
    }

    async fn revoke_credentials(
        &mut self,
        region: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<u64> {
        let user_id = self.user.id;
        let revoked: Vec<_> = self
            .credentials()
            .await
            .into_values()
            .filter(|c| {
                c.user_id == user_id && c.is_active() && region.is_none_or(|r| c.region == r)
            })
            .collect();

        let count = revoked.len() as u64;
        for mut credential in revoked {
            credential.revoked_at = Some(at);
            self.staged.credentials.insert(credential.id, credential);
        }
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        if self.take_injected_conflict().await {
            return Err(LedgerError::Conflict("injected conflict".into()));
        }

        let MemoryLedgerTx {
            ledger,
            user,
            staged,
            _guard,
        } = *self;
        let mut state = ledger.inner.state.lock().await;

        let payments = overlay(&state.payments, &staged.payments);
        for staged_payment in staged.payments.values() {
            let Some(reference) = staged_payment.external_reference.as_deref() else {
                continue;
            };
            let holders = payments
                .values()
                .filter(|p| p.external_reference.as_deref() == Some(reference))
                .count();
            if holders > 1 {
                return Err(LedgerError::Conflict(format!(
                    "external reference {reference} already recorded"
                )));
            }
        }

        let subscriptions = overlay(&state.subscriptions, &staged.subscriptions);
        let live = subscriptions
            .values()
            .filter(|s| s.user_id == user.id && s.is_live())
            .count();
        if live > 1 {
            return Err(LedgerError::Conflict(format!(
                "user {} would hold {live} live subscriptions",
                user.id
            )));
        }

        let credentials = overlay(&state.credentials, &staged.credentials);
        let mut active_regions = HashSet::new();
        for credential in credentials.values().filter(|c| c.user_id == user.id && c.is_active()) {
            if !active_regions.insert(credential.region.as_str()) {
                return Err(LedgerError::Conflict(format!(
                    "user {} already holds an active credential in {}",
                    user.id, credential.region
                )));
            }
        }

        if staged.user {
            state.users.insert(user.id, user.clone());
        }
        state.payments = payments;
        state.subscriptions = subscriptions;
        state.credentials = credentials;
        state.payouts.extend(staged.payouts);
        for op in &staged.commission_ops {
            if let Some(referral) = state.referrals.get_mut(&op.referral_id()) {
                op.apply(referral);
            }
        }

        debug!("Ledger transaction for user {} committed", user.id);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;
    use rust_decimal_macros::dec;

    fn new_user(telegram_id: i64, code: &str, referred_by: Option<i64>) -> NewUser {
        NewUser {
            telegram_id,
            username: None,
            first_name: Some("Test".into()),
            language_code: Some("en".into()),
            referral_code: code.into(),
            referred_by_user_id: referred_by,
            region: "US".into(),
        }
    }

    fn pending(user_id: i64, reference: &str) -> NewPayment {
        NewPayment {
            user_id,
            plan_id: None,
            payment_method: PaymentMethod::Ton,
            amount: dec!(9.99),
            currency: Some("USD".into()),
            crypto_amount: None,
            external_reference: Some(reference.into()),
            status: PaymentStatus::Pending,
            payload: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_user_is_idempotent_on_telegram_id() {
        let ledger = MemoryLedger::new();
        let (first, created) = ledger.create_user(new_user(42, "AAAA1111", None)).await.unwrap();
        assert!(created);

        let (again, created) = ledger.create_user(new_user(42, "BBBB2222", None)).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);
        assert_eq!(again.referral_code, "AAAA1111");
    }

    #[tokio::test]
    async fn referred_user_gets_referral_edge() {
        let ledger = MemoryLedger::new();
        let (referrer, _) = ledger.create_user(new_user(1, "REFERRER", None)).await.unwrap();
        let (referred, _) = ledger
            .create_user(new_user(2, "REFERRED", Some(referrer.id)))
            .await
            .unwrap();

        let edges = ledger.referrals_by_referrer(referrer.id).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].referred_user_id, referred.id);
        assert_eq!(edges[0].commission_amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn begin_for_unknown_user_fails() {
        let ledger = MemoryLedger::new();
        let err = ledger.begin(999).await.err().unwrap();
        assert!(matches!(err, LedgerError::UnknownUser(999)));
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let ledger = MemoryLedger::new();
        let (user, _) = ledger.create_user(new_user(7, "DROPPED1", None)).await.unwrap();

        {
            let mut tx = ledger.begin(user.id).await.unwrap();
            tx.insert_payment(pending(user.id, "ref-1")).await.unwrap();
        }

        assert!(ledger.payments_for_user(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_changes_apply_on_commit_only() {
        let ledger = MemoryLedger::new();
        let (user, _) = ledger.create_user(new_user(8, "MOVER001", None)).await.unwrap();

        {
            let mut tx = ledger.begin(user.id).await.unwrap();
            tx.update_user_region("EU").await.unwrap();
            assert_eq!(tx.user().region, "EU");
        }
        assert_eq!(ledger.user(user.id).await.unwrap().unwrap().region, user.region);

        let mut tx = ledger.begin(user.id).await.unwrap();
        tx.update_user_region("EU").await.unwrap();
        tx.set_user_active(false).await.unwrap();
        tx.commit().await.unwrap();

        let stored = ledger.user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.region, "EU");
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn staged_writes_are_visible_inside_the_transaction() {
        let ledger = MemoryLedger::new();
        let (user, _) = ledger.create_user(new_user(7, "STAGED01", None)).await.unwrap();

        let mut tx = ledger.begin(user.id).await.unwrap();
        let payment = tx.insert_payment(pending(user.id, "ref-1")).await.unwrap();
        let found = tx.payment_by_reference("ref-1").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(payment.id));
        tx.commit().await.unwrap();

        assert_eq!(ledger.payments_for_user(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_reference_across_users_conflicts() {
        let ledger = MemoryLedger::new();
        let (a, _) = ledger.create_user(new_user(1, "USERAAAA", None)).await.unwrap();
        let (b, _) = ledger.create_user(new_user(2, "USERBBBB", None)).await.unwrap();

        let mut tx_a = ledger.begin(a.id).await.unwrap();
        let mut tx_b = ledger.begin(b.id).await.unwrap();
        tx_a.insert_payment(pending(a.id, "shared")).await.unwrap();
        tx_b.insert_payment(pending(b.id, "shared")).await.unwrap();

        tx_a.commit().await.unwrap();
        let err = tx_b.commit().await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn second_live_subscription_conflicts() {
        let ledger = MemoryLedger::new();
        let (user, _) = ledger.create_user(new_user(3, "LIVESUB1", None)).await.unwrap();
        let now = Utc::now();
        let sub = NewSubscription {
            user_id: user.id,
            plan_id: 1,
            start_date: now,
            end_date: now + chrono::Duration::days(30),
            status: SubscriptionStatus::Active,
            is_trial: false,
        };

        let mut tx = ledger.begin(user.id).await.unwrap();
        tx.insert_subscription(sub.clone()).await.unwrap();
        tx.insert_subscription(sub).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_conflict());
        assert!(ledger.subscriptions_for_user(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let ledger = MemoryLedger::new();
        let (user, _) = ledger.create_user(new_user(5, "INJECT01", None)).await.unwrap();
        ledger.inject_conflicts(Some(user.id), 1).await;

        let tx = ledger.begin(user.id).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_conflict());

        let tx = ledger.begin(user.id).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn commission_deltas_apply_on_commit() {
        let ledger = MemoryLedger::new();
        let (referrer, _) = ledger.create_user(new_user(1, "REFERRER", None)).await.unwrap();
        let (referred, _) = ledger
            .create_user(new_user(2, "REFERRED", Some(referrer.id)))
            .await
            .unwrap();

        let mut tx = ledger.begin(referred.id).await.unwrap();
        let edge = tx.referral_for_referred().await.unwrap().unwrap();
        tx.add_commission(edge.id, dec!(1.998), 10).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = ledger.begin(referrer.id).await.unwrap();
        tx.settle_commission(edge.id, dec!(1.998), Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let edge = &ledger.referrals_by_referrer(referrer.id).await.unwrap()[0];
        assert_eq!(edge.commission_amount, dec!(1.998));
        assert_eq!(edge.paid_amount, dec!(1.998));
        assert!(edge.commission_paid);
        assert_eq!(edge.payment_id, Some(10));
    }
}
