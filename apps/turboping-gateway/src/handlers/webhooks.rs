use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use turboping_core::db::models::PaymentMethod;
use turboping_core::{EngineError, PaymentNotification, ReconciliationOutcome};

use crate::auth::{SIGNATURE_HEADER, verify_signature};
use crate::error::ApiError;
use crate::state::AppState;

/// Provider confirmation as forwarded by a rail adapter.
#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    #[serde(default)]
    pub external_reference: Option<String>,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub crypto_amount: Option<Decimal>,
    pub telegram_id: i64,
    #[serde(default)]
    pub plan_id: Option<i64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(rail): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let method: PaymentMethod = match rail.parse() {
        Ok(method) => method,
        Err(_) => return ApiError(EngineError::UnknownRail(rail)).into_response(),
    };

    let Some(secret) = state.config.webhook_secret(method) else {
        warn!("Webhook on {} rejected: no secret configured", method);
        return reject(StatusCode::UNAUTHORIZED, "rail is not accepting webhooks");
    };
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !verify_signature(secret, &body, signature) {
        warn!("Webhook on {} rejected: bad signature", method);
        return reject(StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let parsed: WebhookBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return ApiError(EngineError::InvalidNotification(e.to_string())).into_response();
        }
    };

    let notification = PaymentNotification {
        rail,
        external_reference: parsed.external_reference,
        amount: parsed.amount,
        currency: parsed.currency,
        crypto_amount: parsed.crypto_amount,
        telegram_id: parsed.telegram_id,
        plan_id: parsed.plan_id,
        payload: parsed.payload,
    };

    let now = Utc::now();
    let outcome = match state.reconciler.reconcile_at(&notification, now).await {
        Ok(outcome) => outcome,
        Err(e) => return ApiError(e).into_response(),
    };

    let status = match &outcome {
        ReconciliationOutcome::Completed { events, .. } => {
            if let Some(user_id) = events.first().map(|e| e.user_id()) {
                state.grant_access(user_id, events, now).await;
            }
            StatusCode::OK
        }
        ReconciliationOutcome::Duplicate { .. } => StatusCode::OK,
        ReconciliationOutcome::AmountMismatch { .. }
        | ReconciliationOutcome::NoMatchingIntent { .. }
        | ReconciliationOutcome::AlreadySettled { .. } => {
            info!(
                "Payment {} on {} needs operator review: {}",
                outcome.payment_id(),
                method,
                outcome.label()
            );
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };

    (status, Json(outcome)).into_response()
}
