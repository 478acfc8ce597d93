use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use turboping_core::EngineError;

const RETRY_AFTER_SECS: &str = "5";

/// Engine failure rendered as `{"error": ...}` with a status code the bot
/// and the payment providers can act on.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::UnknownRail(_)
            | EngineError::InvalidNotification(_)
            | EngineError::UnknownPlan(_)
            | EngineError::UnknownRegion(_)
            | EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::UserDeactivated(_) => StatusCode::FORBIDDEN,
            EngineError::UnknownUser(_) | EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::AlreadyHasSubscription(_)
            | EngineError::PayoutAlreadyOpen(_)
            | EngineError::NoLiveSubscription(_)
            | EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            EngineError::BelowMinimumPayout { .. } | EngineError::NoTrialPlan => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::ReconciliationFailed { .. } | EngineError::Storage(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::InvariantViolation(_)
            | EngineError::InvalidConfig(_)
            | EngineError::Vault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        let body = Json(json!({ "error": self.0.to_string() }));
        if self.0.is_transient() {
            return (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response();
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turboping_core::db::LedgerError;

    #[test]
    fn storage_trouble_is_retryable_for_the_caller() {
        let busy = ApiError(EngineError::Storage(LedgerError::Conflict("deadlock".into())));
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);

        let gave_up = ApiError(EngineError::ReconciliationFailed { attempts: 4 });
        assert_eq!(gave_up.status(), StatusCode::SERVICE_UNAVAILABLE);

        let broken = ApiError(EngineError::InvariantViolation("two live subscriptions".into()));
        assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let rail = ApiError(EngineError::UnknownRail("paypal".into()));
        assert_eq!(rail.status(), StatusCode::BAD_REQUEST);

        let inactive = ApiError(EngineError::UserDeactivated(3));
        assert_eq!(inactive.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn transient_failures_carry_retry_after() {
        let resp = ApiError(EngineError::ReconciliationFailed { attempts: 4 }).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], RETRY_AFTER_SECS);

        let resp = ApiError(EngineError::NoLiveSubscription(1)).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(resp.headers().get(header::RETRY_AFTER).is_none());
    }
}
