//! Transaction contract shared by every ledger backend.
//!
//! All mutation goes through a [`LedgerTx`] scoped to a single user. Opening
//! one locks that user's row until `commit` or `rollback`, so a payment that
//! extends a subscription and a sweep that expires it can never interleave.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::LedgerResult;
use crate::models::{
    NewObserverLog, NewPayment, NewProxyCredential, NewReferralPayout, NewSubscription,
    NewSubscriptionPlan, NewUser, Payment, PaymentMethod, ProxyCredential, Referral,
    ReferralPayout, Subscription, SubscriptionPlan, User,
};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Opens a transaction holding the row lock of `user_id`.
    async fn begin(&self, user_id: i64) -> LedgerResult<Box<dyn LedgerTx>>;

    /// Inserts the user (and the referral edge when `referred_by_user_id` is
    /// set) atomically. Returns the existing row untouched when the telegram
    /// id is already known; the flag tells whether a row was created.
    async fn create_user(&self, new: NewUser) -> LedgerResult<(User, bool)>;
    async fn user(&self, user_id: i64) -> LedgerResult<Option<User>>;
    async fn user_by_telegram_id(&self, telegram_id: i64) -> LedgerResult<Option<User>>;
    async fn user_by_referral_code(&self, code: &str) -> LedgerResult<Option<User>>;

    async fn create_plan(&self, new: NewSubscriptionPlan) -> LedgerResult<SubscriptionPlan>;
    async fn plan(&self, plan_id: i64) -> LedgerResult<Option<SubscriptionPlan>>;
    async fn active_plans(&self) -> LedgerResult<Vec<SubscriptionPlan>>;

    async fn subscription(&self, subscription_id: i64) -> LedgerResult<Option<Subscription>>;
    async fn subscriptions_for_user(&self, user_id: i64) -> LedgerResult<Vec<Subscription>>;
    /// Non-terminal subscriptions whose end date falls on or before `horizon`.
    async fn due_subscriptions(&self, horizon: DateTime<Utc>) -> LedgerResult<Vec<Subscription>>;

    async fn payment(&self, payment_id: i64) -> LedgerResult<Option<Payment>>;
    async fn payments_for_user(&self, user_id: i64) -> LedgerResult<Vec<Payment>>;

    async fn referrals_by_referrer(&self, referrer_id: i64) -> LedgerResult<Vec<Referral>>;
    async fn payout(&self, payout_id: i64) -> LedgerResult<Option<ReferralPayout>>;
    async fn payouts_for_user(&self, user_id: i64) -> LedgerResult<Vec<ReferralPayout>>;

    async fn active_credential(
        &self,
        user_id: i64,
        region: &str,
    ) -> LedgerResult<Option<ProxyCredential>>;

    async fn record_observer_log(&self, entry: NewObserverLog) -> LedgerResult<()>;
}

/// Unit of work over one locked user. Dropping without `commit` discards
/// every staged write.
#[async_trait]
pub trait LedgerTx: Send {
    /// The locked user row as read at `begin`, with this transaction's own
    /// changes applied.
    fn user(&self) -> &User;
    async fn update_user_region(&mut self, region: &str) -> LedgerResult<()>;
    async fn set_user_active(&mut self, active: bool) -> LedgerResult<()>;

    async fn plan(&mut self, plan_id: i64) -> LedgerResult<Option<SubscriptionPlan>>;
    async fn trial_plan(&mut self) -> LedgerResult<Option<SubscriptionPlan>>;

    /// Looks the reference up across all users: it is a global key.
    async fn payment_by_reference(&mut self, reference: &str) -> LedgerResult<Option<Payment>>;
    /// Newest pending payment of this user on `method` that has no external
    /// reference attached yet.
    async fn latest_pending_intent(&mut self, method: PaymentMethod)
    -> LedgerResult<Option<Payment>>;
    async fn completed_payment_count(&mut self) -> LedgerResult<i64>;
    async fn insert_payment(&mut self, new: NewPayment) -> LedgerResult<Payment>;
    async fn update_payment(&mut self, payment: &Payment) -> LedgerResult<()>;

    /// This user's subscriptions in a non-terminal status.
    async fn live_subscriptions(&mut self) -> LedgerResult<Vec<Subscription>>;
    async fn subscription(&mut self, subscription_id: i64) -> LedgerResult<Option<Subscription>>;
    async fn has_had_trial(&mut self) -> LedgerResult<bool>;
    async fn insert_subscription(&mut self, new: NewSubscription) -> LedgerResult<Subscription>;
    async fn update_subscription(&mut self, subscription: &Subscription) -> LedgerResult<()>;

    /// The edge pointing at this user, if somebody referred them.
    async fn referral_for_referred(&mut self) -> LedgerResult<Option<Referral>>;
    /// Edges where this user is the referrer, oldest first.
    async fn referrals_as_referrer(&mut self) -> LedgerResult<Vec<Referral>>;
    async fn add_commission(
        &mut self,
        referral_id: i64,
        amount: Decimal,
        payment_id: i64,
    ) -> LedgerResult<()>;
    async fn settle_commission(
        &mut self,
        referral_id: i64,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    async fn open_payout(&mut self) -> LedgerResult<Option<ReferralPayout>>;
    async fn payout(&mut self, payout_id: i64) -> LedgerResult<Option<ReferralPayout>>;
    async fn insert_payout(&mut self, new: NewReferralPayout) -> LedgerResult<ReferralPayout>;
    async fn update_payout(&mut self, payout: &ReferralPayout) -> LedgerResult<()>;

    async fn active_credential(&mut self, region: &str) -> LedgerResult<Option<ProxyCredential>>;
    async fn insert_credential(&mut self, new: NewProxyCredential)
    -> LedgerResult<ProxyCredential>;
    /// Stamps `revoked_at` on active credentials, all regions when `None`.
    async fn revoke_credentials(
        &mut self,
        region: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<u64>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;
    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}
