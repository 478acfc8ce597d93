use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{UnknownVariant, text_column};

/// Payment rail a money movement travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Ton,
    TelegramStars,
    Nowpayments,
    Coinbase,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 4] = [
        PaymentMethod::Ton,
        PaymentMethod::TelegramStars,
        PaymentMethod::Nowpayments,
        PaymentMethod::Coinbase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Ton => "ton",
            PaymentMethod::TelegramStars => "telegram_stars",
            PaymentMethod::Nowpayments => "nowpayments",
            PaymentMethod::Coinbase => "coinbase",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = UnknownVariant;

    /// Case and surrounding whitespace are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ton" => Ok(PaymentMethod::Ton),
            "telegram_stars" | "stars" => Ok(PaymentMethod::TelegramStars),
            "nowpayments" => Ok(PaymentMethod::Nowpayments),
            "coinbase" => Ok(PaymentMethod::Coinbase),
            _ => Err(UnknownVariant {
                kind: "payment method",
                value: s.to_string(),
            }),
        }
    }
}

text_column!(PaymentMethod);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(UnknownVariant {
                kind: "payment status",
                value: other.to_string(),
            }),
        }
    }
}

text_column!(PaymentStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub subscription_id: Option<i64>,
    pub plan_id: Option<i64>,
    pub payment_method: PaymentMethod,
    /// Amount in the reference currency.
    pub amount: Decimal,
    pub currency: Option<String>,
    pub crypto_amount: Option<Decimal>,
    /// Rail-issued id (tx hash, charge id, provider id). Globally unique.
    pub external_reference: Option<String>,
    pub status: PaymentStatus,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: i64,
    pub plan_id: Option<i64>,
    pub payment_method: PaymentMethod,
    pub amount: Decimal,
    pub currency: Option<String>,
    pub crypto_amount: Option<Decimal>,
    pub external_reference: Option<String>,
    pub status: PaymentStatus,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
