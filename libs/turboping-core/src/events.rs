use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Outbound facts produced by the engine for surfaces to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ReminderDue {
        user_id: i64,
        subscription_id: i64,
        days_before_expiry: i64,
        end_date: DateTime<Utc>,
    },
    CredentialsRevoke {
        user_id: i64,
        region: String,
    },
    SubscriptionExtended {
        user_id: i64,
        subscription_id: i64,
        new_end_date: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn user_id(&self) -> i64 {
        match self {
            LifecycleEvent::ReminderDue { user_id, .. }
            | LifecycleEvent::CredentialsRevoke { user_id, .. }
            | LifecycleEvent::SubscriptionExtended { user_id, .. } => *user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::ReminderDue { .. } => "reminder_due",
            LifecycleEvent::CredentialsRevoke { .. } => "credentials_revoke",
            LifecycleEvent::SubscriptionExtended { .. } => "subscription_extended",
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans events out to every sink. A failing sink is logged and counted but
/// never fails the caller: the ledger state is already committed.
#[derive(Clone, Default)]
pub struct Dispatcher {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn dispatch(&self, events: &[LifecycleEvent]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for event in events {
            for sink in &self.sinks {
                match sink.deliver(event).await {
                    Ok(()) => {
                        report.delivered += 1;
                        debug!("Delivered {} for user {} via {}", event.kind(), event.user_id(), sink.name());
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            "Sink {} failed to deliver {} for user {}: {:#}",
                            sink.name(),
                            event.kind(),
                            event.user_id(),
                            e
                        );
                    }
                }
            }
        }
        report
    }
}

/// Keeps every delivered event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub async fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
