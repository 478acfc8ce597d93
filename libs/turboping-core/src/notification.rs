use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use turboping_db::models::PaymentStatus;

use crate::commission::CommissionDelta;
use crate::events::LifecycleEvent;

/// A payment confirmation from one rail, already fetched and parsed by the
/// rail adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub rail: String,
    #[serde(default)]
    pub external_reference: Option<String>,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub crypto_amount: Option<Decimal>,
    /// Telegram id of the payer, taken from provider metadata.
    pub telegram_id: i64,
    /// Plan to bill when no pending intent exists.
    #[serde(default)]
    pub plan_id: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PaymentNotification {
    /// The reference with surrounding whitespace removed; blank counts as absent.
    pub fn reference(&self) -> Option<&str> {
        self.external_reference
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    Completed {
        payment_id: i64,
        subscription_id: i64,
        new_end_date: chrono::DateTime<chrono::Utc>,
        commission: Option<CommissionDelta>,
        #[serde(skip)]
        events: Vec<LifecycleEvent>,
    },
    Duplicate {
        payment_id: i64,
    },
    AmountMismatch {
        payment_id: i64,
        expected: Decimal,
        received: Decimal,
    },
    AlreadySettled {
        payment_id: i64,
        status: PaymentStatus,
    },
    NoMatchingIntent {
        payment_id: i64,
    },
}

impl ReconciliationOutcome {
    pub fn payment_id(&self) -> i64 {
        match self {
            ReconciliationOutcome::Completed { payment_id, .. }
            | ReconciliationOutcome::Duplicate { payment_id }
            | ReconciliationOutcome::AmountMismatch { payment_id, .. }
            | ReconciliationOutcome::AlreadySettled { payment_id, .. }
            | ReconciliationOutcome::NoMatchingIntent { payment_id } => *payment_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconciliationOutcome::Completed { .. } => "completed",
            ReconciliationOutcome::Duplicate { .. } => "duplicate",
            ReconciliationOutcome::AmountMismatch { .. } => "amount_mismatch",
            ReconciliationOutcome::AlreadySettled { .. } => "already_settled",
            ReconciliationOutcome::NoMatchingIntent { .. } => "no_matching_intent",
        }
    }

    /// Events to dispatch after the transaction committed.
    pub fn events(&self) -> &[LifecycleEvent] {
        match self {
            ReconciliationOutcome::Completed { events, .. } => events,
            _ => &[],
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ReconciliationOutcome::Completed { .. } | ReconciliationOutcome::Duplicate { .. }
        )
    }
}
