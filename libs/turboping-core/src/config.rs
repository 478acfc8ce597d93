use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// When a referred user's completed payment earns their referrer commission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionPolicy {
    #[default]
    FirstPayment,
    EveryPayment,
}

/// Tunables shared by the reconciler, the lifecycle manager and the
/// commission calculator. Built once by the binary and passed in, never read
/// from the environment by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub commission_percent: Decimal,
    pub commission_policy: CommissionPolicy,
    pub minimum_payout: Decimal,
    pub reminder_offsets_days: Vec<i64>,
    pub amount_tolerance: Decimal,
    pub max_reconcile_retries: u32,
    pub reference_currency: String,
    /// When false, a user whose last subscription ended may take another trial.
    pub trial_once_per_user: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commission_percent: Decimal::from(20),
            commission_policy: CommissionPolicy::FirstPayment,
            minimum_payout: Decimal::from(10),
            reminder_offsets_days: vec![7, 1],
            amount_tolerance: Decimal::ZERO,
            max_reconcile_retries: 3,
            reference_currency: "USD".to_string(),
            trial_once_per_user: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.commission_percent < Decimal::ZERO || self.commission_percent > Decimal::ONE_HUNDRED {
            return Err(EngineError::InvalidConfig(format!(
                "commission_percent must be within 0..=100, got {}",
                self.commission_percent
            )));
        }
        if self.minimum_payout < Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "minimum_payout must not be negative".into(),
            ));
        }
        if self.reminder_offsets_days.is_empty() {
            return Err(EngineError::InvalidConfig(
                "reminder_offsets_days must not be empty".into(),
            ));
        }
        if let Some(bad) = self.reminder_offsets_days.iter().find(|d| **d <= 0) {
            return Err(EngineError::InvalidConfig(format!(
                "reminder offsets must be positive, got {bad}"
            )));
        }
        if self.amount_tolerance < Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "amount_tolerance must not be negative".into(),
            ));
        }
        if self.reference_currency.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "reference_currency must be set".into(),
            ));
        }
        Ok(())
    }

    /// Furthest reminder offset; the sweep looks this far ahead.
    pub fn max_reminder_offset(&self) -> i64 {
        self.reminder_offsets_days.iter().copied().max().unwrap_or(0)
    }

    /// Attempts a reconciliation gets: the first try plus the retries.
    pub fn reconcile_attempts(&self) -> u32 {
        self.max_reconcile_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_reminder_offset(), 7);
        assert_eq!(config.reconcile_attempts(), 4);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = EngineConfig {
            commission_percent: Decimal::from(101),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        config.commission_percent = Decimal::from(20);
        config.reminder_offsets_days = vec![7, 0];
        assert!(config.validate().is_err());

        config.reminder_offsets_days = vec![];
        assert!(config.validate().is_err());

        config.reminder_offsets_days = vec![3];
        config.amount_tolerance = Decimal::NEGATIVE_ONE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "commission_percent": "15", "commission_policy": "every_payment" }"#,
        )
        .unwrap();
        assert_eq!(config.commission_percent, Decimal::from(15));
        assert_eq!(config.commission_policy, CommissionPolicy::EveryPayment);
        assert_eq!(config.reminder_offsets_days, vec![7, 1]);
    }
}
