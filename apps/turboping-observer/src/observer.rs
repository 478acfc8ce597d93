use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use turboping_core::db::Ledger;
use turboping_core::db::models::NewObserverLog;
use turboping_core::{Dispatcher, EngineConfig, Lifecycle, SweepReport, TelegramNotifier};

const TASK_SWEEP: &str = "expiry_sweep";
const TASK_SUBSCRIPTION: &str = "subscription_check";

/// Drives the lifecycle sweep on a timer and reports what it did.
pub struct Observer {
    ledger: Arc<dyn Ledger>,
    lifecycle: Lifecycle,
    dispatcher: Dispatcher,
    alerts: Option<(TelegramNotifier, i64)>,
}

impl Observer {
    pub fn new(ledger: Arc<dyn Ledger>, config: Arc<EngineConfig>, dispatcher: Dispatcher) -> Self {
        Self {
            lifecycle: Lifecycle::new(ledger.clone(), config),
            ledger,
            dispatcher,
            alerts: None,
        }
    }

    pub fn with_admin_alerts(mut self, notifier: TelegramNotifier, chat_id: i64) -> Self {
        self.alerts = Some((notifier, chat_id));
        self
    }

    /// Sweeps every `interval` until Ctrl-C. The first sweep runs at once.
    pub async fn start(&self, interval: Duration) {
        info!("Observer started, sweeping every {}s", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!("Expiry sweep failed: {:#}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, observer stopping");
                    break;
                }
            }
        }
    }

    /// One sweep: transitions, event delivery, an audit row for the run and
    /// one per failed subscription, and an admin alert when anything failed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let report = match self.lifecycle.sweep(now).await {
            Ok(report) => report,
            Err(e) => {
                self.record(NewObserverLog {
                    task_type: TASK_SWEEP.into(),
                    user_id: None,
                    subscription_id: None,
                    status: "failed".into(),
                    message: Some(e.to_string()),
                    execution_time_ms: None,
                })
                .await;
                self.alert(&format!("⚠️ <b>Expiry sweep aborted</b>\n\n{e}")).await;
                return Err(e.into());
            }
        };

        let delivery = self.dispatcher.dispatch(&report.events).await;

        for failure in &report.failures {
            self.record(NewObserverLog {
                task_type: TASK_SUBSCRIPTION.into(),
                user_id: Some(failure.user_id),
                subscription_id: Some(failure.subscription_id),
                status: "failed".into(),
                message: Some(failure.error.clone()),
                execution_time_ms: None,
            })
            .await;
        }

        let summary = format!(
            "examined {}, transitions {}, reminders {}, expired {}, failures {}, notifications {}/{}",
            report.examined,
            report.transitions.len(),
            report.reminders(),
            report.expired(),
            report.failures.len(),
            delivery.delivered,
            delivery.delivered + delivery.failed
        );
        self.record(NewObserverLog {
            task_type: TASK_SWEEP.into(),
            user_id: None,
            subscription_id: None,
            status: if report.has_failures() { "failed" } else { "success" }.into(),
            message: Some(summary.clone()),
            execution_time_ms: Some(report.duration_ms),
        })
        .await;

        if report.has_failures() {
            self.alert(&format!(
                "⚠️ <b>Expiry sweep finished with {} failures</b>\n\n{}",
                report.failures.len(),
                summary
            ))
            .await;
        }

        info!("Sweep done: {}", summary);
        Ok(report)
    }

    async fn record(&self, entry: NewObserverLog) {
        if let Err(e) = self.ledger.record_observer_log(entry).await {
            warn!("Failed to record observer log: {}", e);
        }
    }

    async fn alert(&self, text: &str) {
        if let Some((notifier, chat_id)) = &self.alerts {
            if let Err(e) = notifier.alert(*chat_id, text).await {
                warn!("Failed to alert admin chat {}: {:#}", chat_id, e);
            }
        }
    }
}
