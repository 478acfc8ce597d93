//! Endpoints the Telegram bot calls on behalf of its users.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use turboping_core::db::models::{
    Payment, PaymentMethod, ReferralPayout, Subscription, SubscriptionPlan, User,
};
use turboping_core::{EngineError, Registration, RevealedCredential};

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

pub async fn register_user(
    State(state): State<AppState>,
    Json(registration): Json<Registration>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let (user, created) = state.users.register(registration).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(user)))
}

#[derive(Debug, Deserialize)]
pub struct IntentRequest {
    pub user_id: i64,
    pub plan_id: i64,
    pub rail: String,
    #[serde(default)]
    pub external_reference: Option<String>,
}

/// Plans on sale, shortest first.
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<SubscriptionPlan>>> {
    let plans = state.ledger.active_plans().await.map_err(EngineError::from)?;
    Ok(Json(plans.into_iter().filter(|p| !p.is_trial).collect()))
}

pub async fn create_intent(
    State(state): State<AppState>,
    Json(req): Json<IntentRequest>,
) -> ApiResult<(StatusCode, Json<Payment>)> {
    let rail: PaymentMethod = req
        .rail
        .parse()
        .map_err(|_| EngineError::UnknownRail(req.rail.clone()))?;
    let payment = state
        .intents
        .create(req.user_id, req.plan_id, rail, req.external_reference, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn grant_trial(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let now = Utc::now();
    let subscription = state.lifecycle.grant_trial(user_id, now).await?;
    state.grant_access(user_id, &[], now).await;
    Ok((StatusCode::CREATED, Json(subscription)))
}

#[derive(Debug, Serialize)]
pub struct PayoutSummary {
    pub eligible: Decimal,
    pub minimum: Decimal,
    pub payouts: Vec<ReferralPayout>,
}

pub async fn payout_summary(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<PayoutSummary>> {
    if state.ledger.user(user_id).await.map_err(EngineError::from)?.is_none() {
        return Err(EngineError::UnknownUser(user_id).into());
    }
    Ok(Json(PayoutSummary {
        eligible: state.commission.eligible_payout(user_id).await?,
        minimum: state.commission.minimum_payout(),
        payouts: state
            .ledger
            .payouts_for_user(user_id)
            .await
            .map_err(EngineError::from)?,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct PayoutRequest {
    #[serde(default)]
    pub payout_method: Option<String>,
    #[serde(default)]
    pub payout_address: Option<String>,
}

pub async fn request_payout(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<PayoutRequest>,
) -> ApiResult<(StatusCode, Json<ReferralPayout>)> {
    let payout = state
        .payouts
        .request(user_id, req.payout_method, req.payout_address, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(payout)))
}

async fn user_region(state: &AppState, user_id: i64) -> ApiResult<String> {
    let user = state
        .ledger
        .user(user_id)
        .await
        .map_err(EngineError::from)?
        .ok_or(EngineError::UnknownUser(user_id))?;
    Ok(user.region)
}

/// The user's credential for their home region, decrypted.
pub async fn reveal_credential(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<RevealedCredential>> {
    let region = user_region(&state, user_id).await?;
    let credential = state
        .ledger
        .active_credential(user_id, &region)
        .await
        .map_err(EngineError::from)?
        .ok_or(EngineError::NotFound {
            entity: "credential",
            id: user_id,
        })?;
    Ok(Json(state.credentials.reveal(&credential)?))
}

pub async fn rotate_credential(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<RevealedCredential>> {
    let region = user_region(&state, user_id).await?;
    let has_access = state
        .ledger
        .subscriptions_for_user(user_id)
        .await
        .map_err(EngineError::from)?
        .iter()
        .any(Subscription::is_live);
    if !has_access {
        return Err(EngineError::NoLiveSubscription(user_id).into());
    }
    let credential = state.credentials.rotate(user_id, &region, Utc::now()).await?;
    Ok(Json(state.credentials.reveal(&credential)?))
}

#[derive(Debug, Deserialize)]
pub struct RegionChange {
    pub region: String,
}

#[derive(Debug, Serialize)]
pub struct RegionChanged {
    pub region: String,
    pub credential: Option<RevealedCredential>,
}

pub async fn change_region(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<RegionChange>,
) -> ApiResult<Json<RegionChanged>> {
    let credential = state
        .credentials
        .change_region(user_id, &req.region, Utc::now())
        .await?;
    let credential = credential
        .map(|c| state.credentials.reveal(&c))
        .transpose()?;
    Ok(Json(RegionChanged {
        region: req.region.trim().to_ascii_uppercase(),
        credential,
    }))
}
