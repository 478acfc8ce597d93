use rust_decimal::Decimal;
use thiserror::Error;
use turboping_db::LedgerError;

use crate::vault::VaultError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures of engine operations. Expected reconciliation results
/// (duplicate, mismatch, settled, no intent) are not errors; see
/// [`crate::ReconciliationOutcome`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown payment rail '{0}'")]
    UnknownRail(String),
    #[error("invalid notification: {0}")]
    InvalidNotification(String),
    #[error("unknown user {0}")]
    UnknownUser(i64),
    #[error("plan {0} does not exist or is not on sale")]
    UnknownPlan(i64),
    #[error("no active trial plan is configured")]
    NoTrialPlan,
    #[error("user {0} already has a subscription or has used their trial")]
    AlreadyHasSubscription(i64),
    #[error("user {0} has no live subscription")]
    NoLiveSubscription(i64),
    #[error("user {0} is deactivated")]
    UserDeactivated(i64),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("reconciliation failed after {attempts} attempts")]
    ReconciliationFailed { attempts: u32 },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("cannot move {entity} {id} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: String,
        to: String,
    },
    #[error("eligible payout {available} is below the minimum of {minimum}")]
    BelowMinimumPayout { available: Decimal, minimum: Decimal },
    #[error("user {0} already has an open payout request")]
    PayoutAlreadyOpen(i64),
    #[error("no proxy server configured for region {0}")]
    UnknownRegion(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Storage(LedgerError),
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownUser(id) => EngineError::UnknownUser(id),
            LedgerError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            other => EngineError::Storage(other),
        }
    }
}

impl EngineError {
    /// Lost a race with a concurrent writer; the operation may be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Storage(e) if e.is_conflict())
    }

    /// Worth retrying later from the outside: storage trouble or an
    /// exhausted retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Storage(_) | EngineError::ReconciliationFailed { .. }
        )
    }
}
