mod common;

use chrono::Duration;
use common::{Harness, t0, ton_payment};
use rust_decimal_macros::dec;
use turboping_core::db::Ledger;
use turboping_core::db::models::{NewProxyCredential, SubscriptionStatus};
use turboping_core::{EngineConfig, EngineError, LifecycleEvent};

async fn paid_user(h: &Harness, telegram_id: i64) -> (i64, i64) {
    let user = h.user(telegram_id).await;
    let n = ton_payment(&user, &format!("tx-sweep-{telegram_id}"), dec!(9.99), h.monthly.id);
    let outcome = h.reconciler.reconcile_at(&n, t0()).await.unwrap();
    let turboping_core::ReconciliationOutcome::Completed { subscription_id, .. } = outcome else {
        panic!("setup payment failed: {outcome:?}");
    };
    (user.id, subscription_id)
}

async fn give_credential(h: &Harness, user_id: i64) {
    let mut tx = h.ledger.begin(user_id).await.unwrap();
    tx.insert_credential(NewProxyCredential {
        user_id,
        region: "US".into(),
        proxy_host: "us.proxy.example".into(),
        proxy_port: 1080,
        username_encrypted: "u".into(),
        password_encrypted: "p".into(),
        assigned_at: t0(),
    })
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn reminders_fire_once_per_threshold_then_expire() {
    let h = Harness::new(EngineConfig::default()).await;
    let (user_id, sub_id) = paid_user(&h, 1).await;
    give_credential(&h, user_id).await;

    // Ends at t0 + 30d.
    let early = h.lifecycle.sweep(t0() + Duration::days(22)).await.unwrap();
    assert!(early.events.is_empty());

    let week = h.lifecycle.sweep(t0() + Duration::days(23)).await.unwrap();
    assert_eq!(
        week.events,
        vec![LifecycleEvent::ReminderDue {
            user_id,
            subscription_id: sub_id,
            days_before_expiry: 7,
            end_date: t0() + Duration::days(30),
        }]
    );
    let sub = h.ledger.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::ExpiringSoon);

    let next_day = h.lifecycle.sweep(t0() + Duration::days(24)).await.unwrap();
    assert!(next_day.events.is_empty());

    let last_day = h.lifecycle.sweep(t0() + Duration::days(29)).await.unwrap();
    assert_eq!(last_day.reminders(), 1);
    assert!(matches!(
        last_day.events[0],
        LifecycleEvent::ReminderDue { days_before_expiry: 1, .. }
    ));

    let over = h.lifecycle.sweep(t0() + Duration::days(31)).await.unwrap();
    assert_eq!(over.expired(), 1);
    assert_eq!(
        over.events,
        vec![LifecycleEvent::CredentialsRevoke {
            user_id,
            region: "US".into(),
        }]
    );
    let sub = h.ledger.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert!(h.ledger.active_credential(user_id, "US").await.unwrap().is_none());
}

#[tokio::test]
async fn sweep_twice_at_same_instant_is_a_no_op() {
    let h = Harness::new(EngineConfig::default()).await;
    let (_, sub_id) = paid_user(&h, 2).await;

    let at = t0() + Duration::days(25);
    let first = h.lifecycle.sweep(at).await.unwrap();
    let after_first = h.ledger.subscription(sub_id).await.unwrap().unwrap();
    let second = h.lifecycle.sweep(at).await.unwrap();
    let after_second = h.ledger.subscription(sub_id).await.unwrap().unwrap();

    assert_eq!(first.reminders(), 1);
    assert!(second.events.is_empty());
    assert!(second.transitions.is_empty());
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn renewal_during_warning_window_returns_to_active() {
    let h = Harness::new(EngineConfig::default()).await;
    let (user_id, sub_id) = paid_user(&h, 3).await;
    let user = h.ledger.user(user_id).await.unwrap().unwrap();

    h.lifecycle.sweep(t0() + Duration::days(25)).await.unwrap();
    let renewal = ton_payment(&user, "tx-renew", dec!(9.99), h.monthly.id);
    h.reconciler
        .reconcile_at(&renewal, t0() + Duration::days(26))
        .await
        .unwrap();

    let sub = h.ledger.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.end_date, t0() + Duration::days(60));
    assert_eq!(sub.last_reminder_days, None);

    // The renewed term warns again from the start.
    let report = h.lifecycle.sweep(t0() + Duration::days(53)).await.unwrap();
    assert_eq!(report.reminders(), 1);
}

#[tokio::test]
async fn one_failing_user_does_not_stop_the_batch() {
    let h = Harness::new(EngineConfig::default()).await;
    let (broken_user, broken_sub) = paid_user(&h, 4).await;
    let (healthy_user, healthy_sub) = paid_user(&h, 5).await;
    h.ledger.make_unavailable(broken_user).await;

    let report = h.lifecycle.sweep(t0() + Duration::days(31)).await.unwrap();

    assert_eq!(report.examined, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].subscription_id, broken_sub);
    assert_eq!(report.expired(), 1);
    assert_eq!(report.transitions[0].user_id, healthy_user);

    let healthy = h.ledger.subscription(healthy_sub).await.unwrap().unwrap();
    assert_eq!(healthy.status, SubscriptionStatus::Expired);
    let broken = h.ledger.subscription(broken_sub).await.unwrap().unwrap();
    assert_eq!(broken.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn trial_expires_without_reminders() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(6).await;
    let trial = h.lifecycle.grant_trial(user.id, t0()).await.unwrap();

    let warn_window = h.lifecycle.sweep(t0() + Duration::days(6)).await.unwrap();
    assert!(warn_window.events.is_empty());

    let over = h.lifecycle.sweep(t0() + Duration::days(7)).await.unwrap();
    assert_eq!(over.expired(), 1);
    let sub = h.ledger.subscription(trial.id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn cancel_revokes_and_cannot_repeat() {
    let h = Harness::new(EngineConfig::default()).await;
    let (user_id, sub_id) = paid_user(&h, 7).await;
    give_credential(&h, user_id).await;

    let (cancelled, events) = h.lifecycle.cancel(sub_id, t0()).await.unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(
        events,
        vec![LifecycleEvent::CredentialsRevoke {
            user_id,
            region: "US".into(),
        }]
    );
    assert!(h.ledger.active_credential(user_id, "US").await.unwrap().is_none());

    let err = h.lifecycle.cancel(sub_id, t0()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    // Terminal subscriptions are never picked up by the sweep again.
    let report = h.lifecycle.sweep(t0() + Duration::days(40)).await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn payment_after_expiry_starts_a_fresh_subscription() {
    let h = Harness::new(EngineConfig::default()).await;
    let (user_id, old_sub) = paid_user(&h, 8).await;
    let user = h.ledger.user(user_id).await.unwrap().unwrap();
    h.lifecycle.sweep(t0() + Duration::days(31)).await.unwrap();

    let n = ton_payment(&user, "tx-back", dec!(9.99), h.monthly.id);
    let outcome = h
        .reconciler
        .reconcile_at(&n, t0() + Duration::days(40))
        .await
        .unwrap();
    let turboping_core::ReconciliationOutcome::Completed {
        subscription_id,
        new_end_date,
        ..
    } = outcome
    else {
        panic!("expected completed, got {outcome:?}");
    };

    assert_ne!(subscription_id, old_sub);
    assert_eq!(new_end_date, t0() + Duration::days(70));
    let old = h.ledger.subscription(old_sub).await.unwrap().unwrap();
    assert_eq!(old.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn repeat_trials_when_configured() {
    let h = Harness::new(EngineConfig {
        trial_once_per_user: false,
        ..EngineConfig::default()
    })
    .await;
    let user = h.user(9).await;

    let first = h.lifecycle.grant_trial(user.id, t0()).await.unwrap();
    // Still live: never two at once.
    assert!(matches!(
        h.lifecycle.grant_trial(user.id, t0()).await,
        Err(EngineError::AlreadyHasSubscription(_))
    ));

    h.lifecycle.sweep(t0() + Duration::days(8)).await.unwrap();
    let second = h
        .lifecycle
        .grant_trial(user.id, t0() + Duration::days(9))
        .await
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.status, SubscriptionStatus::Trial);
}

#[tokio::test]
async fn manual_extension_clears_the_warning() {
    let h = Harness::new(EngineConfig::default()).await;
    let (user_id, sub_id) = paid_user(&h, 20).await;
    h.lifecycle.sweep(t0() + Duration::days(25)).await.unwrap();

    let (extended, events) = h
        .lifecycle
        .extend(user_id, 10, t0() + Duration::days(26))
        .await
        .unwrap();

    assert_eq!(extended.id, sub_id);
    assert_eq!(extended.status, SubscriptionStatus::Active);
    assert_eq!(extended.end_date, t0() + Duration::days(40));
    assert_eq!(extended.last_reminder_days, None);
    assert_eq!(
        events,
        vec![LifecycleEvent::SubscriptionExtended {
            user_id,
            subscription_id: sub_id,
            new_end_date: t0() + Duration::days(40),
        }]
    );
    let stored = h.ledger.subscription(sub_id).await.unwrap().unwrap();
    assert_eq!(stored, extended);
}

#[tokio::test]
async fn manual_extension_of_an_overdue_subscription_counts_from_now() {
    let h = Harness::new(EngineConfig::default()).await;
    let (user_id, _) = paid_user(&h, 21).await;

    // Past its end date, but the sweep has not run yet.
    let (extended, _) = h
        .lifecycle
        .extend(user_id, 5, t0() + Duration::days(35))
        .await
        .unwrap();
    assert_eq!(extended.end_date, t0() + Duration::days(40));
}

#[tokio::test]
async fn manual_extension_needs_a_live_subscription_and_positive_days() {
    let h = Harness::new(EngineConfig::default()).await;
    let (user_id, _) = paid_user(&h, 22).await;

    assert!(matches!(
        h.lifecycle.extend(user_id, 0, t0()).await,
        Err(EngineError::InvalidRequest(_))
    ));

    h.lifecycle.sweep(t0() + Duration::days(31)).await.unwrap();
    assert!(matches!(
        h.lifecycle.extend(user_id, 7, t0() + Duration::days(32)).await,
        Err(EngineError::NoLiveSubscription(id)) if id == user_id
    ));
    assert!(h.live_subscriptions(user_id).await.is_empty());
}

#[tokio::test]
async fn operator_trial_has_its_own_length_and_ignores_previous_trials() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(23).await;

    h.lifecycle.grant_trial(user.id, t0()).await.unwrap();
    h.lifecycle.sweep(t0() + Duration::days(8)).await.unwrap();
    assert!(matches!(
        h.lifecycle.grant_trial(user.id, t0() + Duration::days(9)).await,
        Err(EngineError::AlreadyHasSubscription(_))
    ));

    let granted = h
        .lifecycle
        .grant_trial_days(user.id, 14, t0() + Duration::days(9))
        .await
        .unwrap();
    assert_eq!(granted.status, SubscriptionStatus::Trial);
    assert_eq!(granted.end_date, t0() + Duration::days(23));

    assert!(matches!(
        h.lifecycle.grant_trial_days(user.id, 14, t0() + Duration::days(10)).await,
        Err(EngineError::AlreadyHasSubscription(_))
    ));
}

#[tokio::test]
async fn deactivated_user_cannot_start_a_trial() {
    let h = Harness::new(EngineConfig::default()).await;
    let user = h.user(24).await;
    h.users.set_active(user.id, false).await.unwrap();

    assert!(matches!(
        h.lifecycle.grant_trial(user.id, t0()).await,
        Err(EngineError::UserDeactivated(id)) if id == user.id
    ));
    assert!(h.live_subscriptions(user.id).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payment_racing_the_expiry_sweep_leaves_one_live_subscription() {
    let h = Harness::new(EngineConfig::default()).await;
    let now = t0() + Duration::days(31);

    for telegram_id in 100..150 {
        let (user_id, _) = paid_user(&h, telegram_id).await;
        let user = h.ledger.user(user_id).await.unwrap().unwrap();
        let renewal = ton_payment(&user, &format!("tx-late-{telegram_id}"), dec!(9.99), h.monthly.id);

        let reconciler = h.reconciler.clone();
        let lifecycle = h.lifecycle.clone();
        let payment = tokio::spawn(async move { reconciler.reconcile_at(&renewal, now).await });
        let sweep = tokio::spawn(async move { lifecycle.sweep(now).await });
        let (payment, sweep) = (payment.await.unwrap(), sweep.await.unwrap());

        assert!(matches!(
            payment.unwrap(),
            turboping_core::ReconciliationOutcome::Completed { .. }
        ));
        assert!(!sweep.unwrap().has_failures());

        // Either order ends the same way: the old term is over and the
        // paid one runs from `now`.
        let live = h.live_subscriptions(user_id).await;
        assert_eq!(live.len(), 1, "user {user_id} has {} live subscriptions", live.len());
        assert_eq!(live[0].status, SubscriptionStatus::Active);
        assert_eq!(live[0].end_date, now + Duration::days(30));
    }
}
