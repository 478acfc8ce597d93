//! Postgres ledger. Every [`LedgerTx`] is a database transaction that
//! starts with `SELECT ... FOR UPDATE` on the user row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{Ledger, LedgerTx};
use crate::models::{
    NewObserverLog, NewPayment, NewProxyCredential, NewReferralPayout, NewSubscription,
    NewSubscriptionPlan, NewUser, Payment, PaymentMethod, ProxyCredential, Referral,
    ReferralPayout, Subscription, SubscriptionPlan, User,
};
use crate::repositories::credential_repo::CREDENTIAL_COLUMNS;
use crate::repositories::payment_repo::PAYMENT_COLUMNS;
use crate::repositories::plan_repo::PLAN_COLUMNS;
use crate::repositories::referral_repo::{PAYOUT_COLUMNS, REFERRAL_COLUMNS};
use crate::repositories::subscription_repo::SUBSCRIPTION_COLUMNS;
use crate::repositories::user_repo::USER_COLUMNS;
use crate::repositories::{
    CredentialRepository, ObserverLogRepository, PaymentRepository, PlanRepository,
    ReferralRepository, SubscriptionRepository, UserRepository,
};

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
    pub users: UserRepository,
    pub plans: PlanRepository,
    pub subscriptions: SubscriptionRepository,
    pub payments: PaymentRepository,
    pub referrals: ReferralRepository,
    pub credentials: CredentialRepository,
    pub observer_logs: ObserverLogRepository,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            subscriptions: SubscriptionRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            referrals: ReferralRepository::new(pool.clone()),
            credentials: CredentialRepository::new(pool.clone()),
            observer_logs: ObserverLogRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self, user_id: i64) -> LedgerResult<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        match user {
            Some(user) => Ok(Box::new(PgLedgerTx { tx, user })),
            None => {
                tx.rollback().await?;
                Err(LedgerError::UnknownUser(user_id))
            }
        }
    }

    async fn create_user(&self, new: NewUser) -> LedgerResult<(User, bool)> {
        self.users.create(new).await
    }

    async fn user(&self, user_id: i64) -> LedgerResult<Option<User>> {
        self.users.get_by_id(user_id).await
    }

    async fn user_by_telegram_id(&self, telegram_id: i64) -> LedgerResult<Option<User>> {
        self.users.get_by_telegram_id(telegram_id).await
    }

    async fn user_by_referral_code(&self, code: &str) -> LedgerResult<Option<User>> {
        self.users.get_by_referral_code(code).await
    }

    async fn create_plan(&self, new: NewSubscriptionPlan) -> LedgerResult<SubscriptionPlan> {
        self.plans.create(new).await
    }

    async fn plan(&self, plan_id: i64) -> LedgerResult<Option<SubscriptionPlan>> {
        self.plans.get_by_id(plan_id).await
    }

    async fn active_plans(&self) -> LedgerResult<Vec<SubscriptionPlan>> {
        self.plans.get_active().await
    }

    async fn subscription(&self, subscription_id: i64) -> LedgerResult<Option<Subscription>> {
        self.subscriptions.get_by_id(subscription_id).await
    }

    async fn subscriptions_for_user(&self, user_id: i64) -> LedgerResult<Vec<Subscription>> {
        self.subscriptions.get_all_by_user(user_id).await
    }

    async fn due_subscriptions(&self, horizon: DateTime<Utc>) -> LedgerResult<Vec<Subscription>> {
        self.subscriptions.get_due(horizon).await
    }

    async fn payment(&self, payment_id: i64) -> LedgerResult<Option<Payment>> {
        self.payments.get_by_id(payment_id).await
    }

    async fn payments_for_user(&self, user_id: i64) -> LedgerResult<Vec<Payment>> {
        self.payments.get_all_by_user(user_id).await
    }

    async fn referrals_by_referrer(&self, referrer_id: i64) -> LedgerResult<Vec<Referral>> {
        self.referrals.get_by_referrer(referrer_id).await
    }

    async fn payout(&self, payout_id: i64) -> LedgerResult<Option<ReferralPayout>> {
        self.referrals.get_payout(payout_id).await
    }

    async fn payouts_for_user(&self, user_id: i64) -> LedgerResult<Vec<ReferralPayout>> {
        self.referrals.get_payouts_by_user(user_id).await
    }

    async fn active_credential(
        &self,
        user_id: i64,
        region: &str,
    ) -> LedgerResult<Option<ProxyCredential>> {
        self.credentials.get_active(user_id, region).await
    }

    async fn record_observer_log(&self, entry: NewObserverLog) -> LedgerResult<()> {
        self.observer_logs.create(entry).await
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    user: User,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    fn user(&self) -> &User {
        &self.user
    }

    async fn update_user_region(&mut self, region: &str) -> LedgerResult<()> {
        sqlx::query("UPDATE users SET region = $2 WHERE id = $1")
            .bind(self.user.id)
            .bind(region)
            .execute(&mut *self.tx)
            .await?;
        self.user.region = region.to_string();
        Ok(())
    }

    async fn set_user_active(&mut self, active: bool) -> LedgerResult<()> {
        sqlx::query("UPDATE users SET is_active = $2 WHERE id = $1")
            .bind(self.user.id)
            .bind(active)
            .execute(&mut *self.tx)
            .await?;
        self.user.is_active = active;
        Ok(())
    }

    async fn plan(&mut self, plan_id: i64) -> LedgerResult<Option<SubscriptionPlan>> {
        let plan = sqlx::query_as::<_, SubscriptionPlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE id = $1"
        ))
        .bind(plan_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(plan)
    }

    async fn trial_plan(&mut self) -> LedgerResult<Option<SubscriptionPlan>> {
        let plan = sqlx::query_as::<_, SubscriptionPlan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans
             WHERE is_trial = TRUE AND is_active = TRUE
             ORDER BY id LIMIT 1"
        ))
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(plan)
    }

    async fn payment_by_reference(&mut self, reference: &str) -> LedgerResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE external_reference = $1 FOR UPDATE"
        ))
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn latest_pending_intent(
        &mut self,
        method: PaymentMethod,
    ) -> LedgerResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE user_id = $1 AND payment_method = $2 AND status = 'pending'
               AND external_reference IS NULL
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(self.user.id)
        .bind(method)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn completed_payment_count(&mut self) -> LedgerResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payments WHERE user_id = $1 AND status = 'completed'",
        )
        .bind(self.user.id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn insert_payment(&mut self, new: NewPayment) -> LedgerResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "INSERT INTO payments (user_id, plan_id, payment_method, amount, currency, crypto_amount,
                                   external_reference, status, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(new.user_id)
        .bind(new.plan_id)
        .bind(new.payment_method)
        .bind(new.amount)
        .bind(&new.currency)
        .bind(new.crypto_amount)
        .bind(&new.external_reference)
        .bind(new.status)
        .bind(&new.payload)
        .bind(new.created_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn update_payment(&mut self, payment: &Payment) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE payments
             SET subscription_id = $2, plan_id = $3, amount = $4, currency = $5, crypto_amount = $6,
                 external_reference = $7, status = $8, payload = $9, completed_at = $10
             WHERE id = $1",
        )
        .bind(payment.id)
        .bind(payment.subscription_id)
        .bind(payment.plan_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.crypto_amount)
        .bind(&payment.external_reference)
        .bind(payment.status)
        .bind(&payment.payload)
        .bind(payment.completed_at)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected(), "payment", payment.id)
    }

    async fn live_subscriptions(&mut self) -> LedgerResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE user_id = $1 AND status IN ('trial', 'active', 'expiring_soon')
             ORDER BY id"
        ))
        .bind(self.user.id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(subs)
    }

    async fn subscription(&mut self, subscription_id: i64) -> LedgerResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 AND user_id = $2"
        ))
        .bind(subscription_id)
        .bind(self.user.id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(sub)
    }

    async fn has_had_trial(&mut self) -> LedgerResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM subscriptions WHERE user_id = $1 AND is_trial = TRUE)",
        )
        .bind(self.user.id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn insert_subscription(&mut self, new: NewSubscription) -> LedgerResult<Subscription> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "INSERT INTO subscriptions (user_id, plan_id, start_date, end_date, status, is_trial, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $3, $3)
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(new.user_id)
        .bind(new.plan_id)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(new.status)
        .bind(new.is_trial)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(sub)
    }

    async fn update_subscription(&mut self, subscription: &Subscription) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions
             SET plan_id = $2, end_date = $3, status = $4, is_trial = $5, auto_renew = $6,
                 last_reminder_days = $7, updated_at = $8
             WHERE id = $1 AND user_id = $9",
        )
        .bind(subscription.id)
        .bind(subscription.plan_id)
        .bind(subscription.end_date)
        .bind(subscription.status)
        .bind(subscription.is_trial)
        .bind(subscription.auto_renew)
        .bind(subscription.last_reminder_days)
        .bind(subscription.updated_at)
        .bind(self.user.id)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected(), "subscription", subscription.id)
    }

    async fn referral_for_referred(&mut self) -> LedgerResult<Option<Referral>> {
        let referral = sqlx::query_as::<_, Referral>(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referred_user_id = $1"
        ))
        .bind(self.user.id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(referral)
    }

    async fn referrals_as_referrer(&mut self) -> LedgerResult<Vec<Referral>> {
        let referrals = sqlx::query_as::<_, Referral>(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referrer_id = $1
             ORDER BY created_at, id FOR UPDATE"
        ))
        .bind(self.user.id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(referrals)
    }

    async fn add_commission(
        &mut self,
        referral_id: i64,
        amount: Decimal,
        payment_id: i64,
    ) -> LedgerResult<()> {
        // Delta update: the referrer's payout flow may settle the same row
        // under a different user lock.
        let result = sqlx::query(
            "UPDATE referrals
             SET commission_amount = commission_amount + $2,
                 payment_id = COALESCE(payment_id, $3),
                 commission_paid = FALSE
             WHERE id = $1",
        )
        .bind(referral_id)
        .bind(amount)
        .bind(payment_id)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected(), "referral", referral_id)
    }

    async fn settle_commission(
        &mut self,
        referral_id: i64,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE referrals
             SET paid_amount = paid_amount + $2,
                 commission_paid = (paid_amount + $2 >= commission_amount),
                 paid_at = $3
             WHERE id = $1",
        )
        .bind(referral_id)
        .bind(amount)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected(), "referral", referral_id)
    }

    async fn open_payout(&mut self) -> LedgerResult<Option<ReferralPayout>> {
        let payout = sqlx::query_as::<_, ReferralPayout>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM referral_payouts
             WHERE user_id = $1 AND status IN ('requested', 'processing')
             ORDER BY requested_at DESC, id DESC LIMIT 1"
        ))
        .bind(self.user.id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payout)
    }

    async fn payout(&mut self, payout_id: i64) -> LedgerResult<Option<ReferralPayout>> {
        let payout = sqlx::query_as::<_, ReferralPayout>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM referral_payouts WHERE id = $1 AND user_id = $2"
        ))
        .bind(payout_id)
        .bind(self.user.id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payout)
    }

    async fn insert_payout(&mut self, new: NewReferralPayout) -> LedgerResult<ReferralPayout> {
        let payout = sqlx::query_as::<_, ReferralPayout>(&format!(
            "INSERT INTO referral_payouts (user_id, amount, payout_method, payout_address, requested_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(new.user_id)
        .bind(new.amount)
        .bind(&new.payout_method)
        .bind(&new.payout_address)
        .bind(new.requested_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(payout)
    }

    async fn update_payout(&mut self, payout: &ReferralPayout) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE referral_payouts
             SET status = $2, admin_notes = $3, processed_at = $4, completed_at = $5
             WHERE id = $1 AND user_id = $6",
        )
        .bind(payout.id)
        .bind(payout.status)
        .bind(&payout.admin_notes)
        .bind(payout.processed_at)
        .bind(payout.completed_at)
        .bind(self.user.id)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected(), "payout", payout.id)
    }

    async fn active_credential(&mut self, region: &str) -> LedgerResult<Option<ProxyCredential>> {
        let credential = sqlx::query_as::<_, ProxyCredential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM proxy_credentials
             WHERE user_id = $1 AND region = $2 AND revoked_at IS NULL"
        ))
        .bind(self.user.id)
        .bind(region)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(credential)
    }

    async fn insert_credential(
        &mut self,
        new: NewProxyCredential,
    ) -> LedgerResult<ProxyCredential> {
        let credential = sqlx::query_as::<_, ProxyCredential>(&format!(
            "INSERT INTO proxy_credentials (user_id, region, proxy_host, proxy_port,
                                            username_encrypted, password_encrypted, assigned_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {CREDENTIAL_COLUMNS}"
        ))
        .bind(new.user_id)
        .bind(&new.region)
        .bind(&new.proxy_host)
        .bind(new.proxy_port)
        .bind(&new.username_encrypted)
        .bind(&new.password_encrypted)
        .bind(new.assigned_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(credential)
    }

    async fn revoke_credentials(
        &mut self,
        region: Option<&str>,
        at: DateTime<Utc>,
    ) -> LedgerResult<u64> {
        let result = sqlx::query(
            "UPDATE proxy_credentials SET revoked_at = $2
             WHERE user_id = $1 AND revoked_at IS NULL AND ($3::TEXT IS NULL OR region = $3)",
        )
        .bind(self.user.id)
        .bind(at)
        .bind(region)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let user_id = self.user.id;
        self.tx.commit().await?;
        debug!("Ledger transaction for user {} committed", user_id);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn expect_one_row(rows: u64, entity: &'static str, id: i64) -> LedgerResult<()> {
    if rows == 0 {
        return Err(LedgerError::NotFound { entity, id });
    }
    Ok(())
}
