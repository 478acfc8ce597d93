use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{UnknownVariant, text_column};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Requested,
    Processing,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Requested => "requested",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, PayoutStatus::Requested | PayoutStatus::Processing)
    }

    /// `requested -> processing -> completed | failed`
    pub fn can_advance_to(&self, next: PayoutStatus) -> bool {
        matches!(
            (self, next),
            (PayoutStatus::Requested, PayoutStatus::Processing)
                | (PayoutStatus::Processing, PayoutStatus::Completed)
                | (PayoutStatus::Processing, PayoutStatus::Failed)
        )
    }
}

impl FromStr for PayoutStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(PayoutStatus::Requested),
            "processing" => Ok(PayoutStatus::Processing),
            "completed" => Ok(PayoutStatus::Completed),
            "failed" => Ok(PayoutStatus::Failed),
            other => Err(UnknownVariant {
                kind: "payout status",
                value: other.to_string(),
            }),
        }
    }
}

text_column!(PayoutStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ReferralPayout {
    pub id: i64,
    pub user_id: i64,
    pub amount: Decimal,
    pub payout_method: Option<String>,
    pub payout_address: Option<String>,
    pub status: PayoutStatus,
    pub admin_notes: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewReferralPayout {
    pub user_id: i64,
    pub amount: Decimal,
    pub payout_method: Option<String>,
    pub payout_address: Option<String>,
    pub requested_at: DateTime<Utc>,
}
