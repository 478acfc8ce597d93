#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use turboping_core::db::models::{NewSubscriptionPlan, Subscription, SubscriptionPlan, User};
use turboping_core::db::{Ledger, MemoryLedger};
use turboping_core::{
    EngineConfig, Lifecycle, PaymentNotification, PayoutService, Reconciler, Registration,
    UserService,
};

pub struct Harness {
    pub ledger: MemoryLedger,
    pub config: Arc<EngineConfig>,
    pub reconciler: Reconciler,
    pub lifecycle: Lifecycle,
    pub payouts: PayoutService,
    pub users: UserService,
    pub monthly: SubscriptionPlan,
    pub trial: SubscriptionPlan,
}

impl Harness {
    pub async fn new(config: EngineConfig) -> Self {
        let ledger = MemoryLedger::new();
        let shared: Arc<dyn Ledger> = Arc::new(ledger.clone());
        let config = Arc::new(config);

        let monthly = ledger
            .create_plan(NewSubscriptionPlan {
                name: "Monthly".into(),
                duration_days: 30,
                price: dec!(9.99),
                is_trial: false,
            })
            .await
            .unwrap();
        let trial = ledger
            .create_plan(NewSubscriptionPlan {
                name: "Trial".into(),
                duration_days: 7,
                price: Decimal::ZERO,
                is_trial: true,
            })
            .await
            .unwrap();

        Self {
            reconciler: Reconciler::new(shared.clone(), config.clone()),
            lifecycle: Lifecycle::new(shared.clone(), config.clone()),
            payouts: PayoutService::new(shared.clone(), config.clone()),
            users: UserService::new(shared),
            ledger,
            config,
            monthly,
            trial,
        }
    }

    pub async fn user(&self, telegram_id: i64) -> User {
        self.users
            .register(Registration {
                telegram_id,
                ..Registration::default()
            })
            .await
            .unwrap()
            .0
    }

    pub async fn referred_user(&self, telegram_id: i64, referrer: &User) -> User {
        self.users
            .register(Registration {
                telegram_id,
                referral_code: Some(referrer.referral_code.clone()),
                ..Registration::default()
            })
            .await
            .unwrap()
            .0
    }

    pub async fn live_subscriptions(&self, user_id: i64) -> Vec<Subscription> {
        self.ledger
            .subscriptions_for_user(user_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.is_live())
            .collect()
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub fn ton_payment(user: &User, reference: &str, amount: Decimal, plan_id: i64) -> PaymentNotification {
    PaymentNotification {
        rail: "ton".into(),
        external_reference: Some(reference.into()),
        amount,
        currency: Some("TON".into()),
        crypto_amount: None,
        telegram_id: user.telegram_id,
        plan_id: Some(plan_id),
        payload: serde_json::json!({ "hash": reference }),
    }
}
