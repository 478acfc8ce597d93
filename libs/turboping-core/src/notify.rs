use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::info;
use turboping_db::Ledger;

use crate::events::{EventSink, LifecycleEvent};

/// Sends lifecycle events to the user's Telegram chat.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
    ledger: Arc<dyn Ledger>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, ledger: Arc<dyn Ledger>) -> Self {
        Self { bot, ledger }
    }

    pub fn from_token(token: &str, ledger: Arc<dyn Ledger>) -> Self {
        Self::new(Bot::new(token), ledger)
    }

    /// Free-form HTML message to an operator chat.
    pub async fn alert(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
            .context("Failed to send admin alert")?;
        Ok(())
    }
}

pub fn render(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::ReminderDue {
            days_before_expiry,
            end_date,
            ..
        } => {
            let when = if *days_before_expiry == 1 {
                "tomorrow".to_string()
            } else {
                format!("in {days_before_expiry} days")
            };
            format!(
                "⏰ <b>Your subscription expires {when}</b>\n\nAccess ends on {}. Renew now to stay connected.",
                end_date.format("%Y-%m-%d %H:%M UTC")
            )
        }
        LifecycleEvent::CredentialsRevoke { region, .. } => format!(
            "🔒 <b>Your subscription has ended</b>\n\nProxy access for region {region} was revoked. Buy a plan to reconnect."
        ),
        LifecycleEvent::SubscriptionExtended { new_end_date, .. } => format!(
            "✅ <b>Payment received</b>\n\nYour subscription is active until {}.",
            new_end_date.format("%Y-%m-%d %H:%M UTC")
        ),
    }
}

#[async_trait]
impl EventSink for TelegramNotifier {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let user = self
            .ledger
            .user(event.user_id())
            .await?
            .with_context(|| format!("user {} vanished", event.user_id()))?;

        self.bot
            .send_message(ChatId(user.telegram_id), render(event))
            .parse_mode(ParseMode::Html)
            .await
            .with_context(|| format!("Failed to notify telegram user {}", user.telegram_id))?;

        info!("Sent {} to telegram user {}", event.kind(), user.telegram_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn reminder_mentions_the_deadline() {
        let end_date = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let text = render(&LifecycleEvent::ReminderDue {
            user_id: 1,
            subscription_id: 2,
            days_before_expiry: 7,
            end_date,
        });
        assert!(text.contains("in 7 days"));
        assert!(text.contains("2026-03-01 12:00 UTC"));

        let tomorrow = render(&LifecycleEvent::ReminderDue {
            user_id: 1,
            subscription_id: 2,
            days_before_expiry: 1,
            end_date,
        });
        assert!(tomorrow.contains("tomorrow"));
    }
}
