mod common;

use chrono::Duration;
use common::{Harness, t0, ton_payment};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use turboping_core::db::models::{PaymentStatus, SubscriptionStatus};
use turboping_core::db::Ledger;
use turboping_core::{CommissionCalculator, EngineConfig, ReconciliationOutcome};

#[tokio::test]
async fn same_notification_twice_extends_once() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(1).await;
    let n = ton_payment(&user, "tx-abc", dec!(9.99), h.monthly.id);

    let first = h.reconciler.reconcile_at(&n, t0()).await.unwrap();
    let second = h.reconciler.reconcile_at(&n, t0() + Duration::hours(1)).await.unwrap();

    assert!(matches!(first, ReconciliationOutcome::Completed { .. }));
    assert_eq!(
        second,
        ReconciliationOutcome::Duplicate {
            payment_id: first.payment_id()
        }
    );

    let payments = h.ledger.payments_for_user(user.id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Completed);

    let live = h.live_subscriptions(user.id).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].end_date, t0() + Duration::days(30));
}

#[tokio::test]
async fn concurrent_duplicates_complete_exactly_once() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(2).await;
    let n = ton_payment(&user, "tx-race", dec!(9.99), h.monthly.id);

    let (a, b) = tokio::join!(
        h.reconciler.reconcile_at(&n, t0()),
        h.reconciler.reconcile_at(&n, t0())
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, ReconciliationOutcome::Completed { .. }))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| matches!(o, ReconciliationOutcome::Duplicate { .. }))
        .count();
    assert_eq!((completed, duplicates), (1, 1));

    let live = h.live_subscriptions(user.id).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].end_date, t0() + Duration::days(30));
}

#[tokio::test]
async fn many_concurrent_payers_keep_one_live_subscription_each() {
    let h = Harness::new(EngineConfig::default()).await;
    let mut users = Vec::new();
    for telegram_id in 10..15 {
        users.push(h.user(telegram_id).await);
    }

    let mut tasks = Vec::new();
    for user in &users {
        for i in 0..3 {
            let reconciler = h.reconciler.clone();
            let n = ton_payment(user, &format!("tx-{}-{i}", user.id), dec!(9.99), h.monthly.id);
            tasks.push(tokio::spawn(async move { reconciler.reconcile_at(&n, t0()).await }));
        }
    }
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, ReconciliationOutcome::Completed { .. }));
    }

    for user in &users {
        let live = h.live_subscriptions(user.id).await;
        assert_eq!(live.len(), 1, "user {} has {} live subscriptions", user.id, live.len());
        assert_eq!(live[0].end_date, t0() + Duration::days(90));
    }
}

#[tokio::test]
async fn end_date_never_decreases() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(3).await;

    let mut last_end = None;
    let times = [t0(), t0() + Duration::days(2), t0() + Duration::days(45), t0() + Duration::days(46)];
    for (i, at) in times.into_iter().enumerate() {
        let n = ton_payment(&user, &format!("tx-mono-{i}"), dec!(9.99), h.monthly.id);
        let outcome = h.reconciler.reconcile_at(&n, at).await.unwrap();
        let ReconciliationOutcome::Completed { new_end_date, .. } = outcome else {
            panic!("payment {i} did not complete: {outcome:?}");
        };
        if let Some(previous) = last_end {
            assert!(new_end_date >= previous);
        }
        last_end = Some(new_end_date);
    }

    // 0 -> 30, 2 -> 60, 45 -> 90, 46 -> 120
    assert_eq!(last_end, Some(t0() + Duration::days(120)));
}

#[tokio::test]
async fn trial_converts_to_active_on_payment() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(4).await;

    let trial = h.lifecycle.grant_trial(user.id, t0()).await.unwrap();
    assert_eq!(trial.status, SubscriptionStatus::Trial);
    assert_eq!(trial.end_date, t0() + Duration::days(7));

    let n = ton_payment(&user, "tx-trial", dec!(9.99), h.monthly.id);
    let outcome = h
        .reconciler
        .reconcile_at(&n, t0() + Duration::days(6))
        .await
        .unwrap();

    let ReconciliationOutcome::Completed {
        subscription_id,
        new_end_date,
        ..
    } = outcome
    else {
        panic!("expected completed, got {outcome:?}");
    };
    assert_eq!(subscription_id, trial.id);
    assert_eq!(new_end_date, t0() + Duration::days(37));

    let sub = h.ledger.subscription(trial.id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn trial_is_granted_once_ever() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(5).await;

    h.lifecycle.grant_trial(user.id, t0()).await.unwrap();
    assert!(h.lifecycle.grant_trial(user.id, t0()).await.is_err());

    h.lifecycle.sweep(t0() + Duration::days(8)).await.unwrap();
    assert!(h.live_subscriptions(user.id).await.is_empty());

    let err = h
        .lifecycle
        .grant_trial(user.id, t0() + Duration::days(9))
        .await
        .unwrap_err();
    assert!(matches!(err, turboping_core::EngineError::AlreadyHasSubscription(id) if id == user.id));
}

#[tokio::test]
async fn amount_mismatch_fails_payment_without_touching_subscription() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(6).await;
    let n = ton_payment(&user, "tx-short", dec!(5.00), h.monthly.id);

    let outcome = h.reconciler.reconcile_at(&n, t0()).await.unwrap();
    assert_eq!(
        outcome,
        ReconciliationOutcome::AmountMismatch {
            payment_id: outcome.payment_id(),
            expected: dec!(9.99),
            received: dec!(5.00),
        }
    );

    let payment = h.ledger.payment(outcome.payment_id()).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(h.ledger.subscriptions_for_user(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn first_payment_pays_referrer_twenty_percent() {
    let h = Harness::new(EngineConfig {
        minimum_payout: Decimal::ZERO,
        ..EngineConfig::default()
    })
    .await;
    let referrer = h.user(100).await;
    let referred = h.referred_user(101, &referrer).await;
    let commission = CommissionCalculator::new(
        std::sync::Arc::new(h.ledger.clone()),
        h.config.clone(),
    );

    let before = commission.eligible_payout(referrer.id).await.unwrap();
    let n = ton_payment(&referred, "tx-ref-1", dec!(9.99), h.monthly.id);
    let outcome = h.reconciler.reconcile_at(&n, t0()).await.unwrap();

    let ReconciliationOutcome::Completed { commission: delta, .. } = &outcome else {
        panic!("expected completed, got {outcome:?}");
    };
    assert_eq!(delta.as_ref().map(|d| d.amount), Some(dec!(1.998)));

    let after = commission.eligible_payout(referrer.id).await.unwrap();
    assert_eq!(after - before, dec!(0.20) * dec!(9.99));

    // Default policy: renewals earn nothing further.
    let renewal = ton_payment(&referred, "tx-ref-2", dec!(9.99), h.monthly.id);
    h.reconciler.reconcile_at(&renewal, t0()).await.unwrap();
    assert_eq!(commission.eligible_payout(referrer.id).await.unwrap(), after);

    // A duplicate never pays twice either.
    h.reconciler.reconcile_at(&n, t0()).await.unwrap();
    assert_eq!(commission.eligible_payout(referrer.id).await.unwrap(), after);
}

#[tokio::test]
async fn every_payment_policy_accrues_on_renewals() {
    let h = Harness::new(EngineConfig {
        minimum_payout: Decimal::ZERO,
        commission_policy: turboping_core::CommissionPolicy::EveryPayment,
        ..EngineConfig::default()
    })
    .await;
    let referrer = h.user(200).await;
    let referred = h.referred_user(201, &referrer).await;

    for i in 0..2 {
        let n = ton_payment(&referred, &format!("tx-every-{i}"), dec!(9.99), h.monthly.id);
        h.reconciler.reconcile_at(&n, t0()).await.unwrap();
    }

    let edges = h.ledger.referrals_by_referrer(referrer.id).await.unwrap();
    assert_eq!(edges[0].commission_amount, dec!(3.996));
    assert!(!edges[0].commission_paid);
}
