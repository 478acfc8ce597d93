use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use turboping_core::db::models::{PayoutStatus, ReferralPayout, Subscription, User};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<i64>,
) -> Result<Json<Subscription>, ApiError> {
    let (subscription, events) = state.lifecycle.cancel(subscription_id, Utc::now()).await?;
    info!("Admin cancelled subscription {}", subscription_id);
    state.dispatcher.dispatch(&events).await;
    Ok(Json(subscription))
}

#[derive(Debug, Deserialize)]
pub struct PayoutUpdate {
    pub status: PayoutStatus,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

pub async fn update_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<i64>,
    Json(update): Json<PayoutUpdate>,
) -> Result<Json<ReferralPayout>, ApiError> {
    let payout = state
        .payouts
        .advance(payout_id, update.status, update.admin_notes, Utc::now())
        .await?;
    Ok(Json(payout))
}

#[derive(Debug, Deserialize)]
pub struct Days {
    pub days: i64,
}

pub async fn extend_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<Days>,
) -> Result<Json<Subscription>, ApiError> {
    let (subscription, events) = state.lifecycle.extend(user_id, req.days, Utc::now()).await?;
    info!("Admin extended subscription of user {} by {} days", user_id, req.days);
    state.dispatcher.dispatch(&events).await;
    Ok(Json(subscription))
}

pub async fn grant_trial(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<Days>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    let now = Utc::now();
    let subscription = state.lifecycle.grant_trial_days(user_id, req.days, now).await?;
    info!("Admin granted user {} a {}-day trial", user_id, req.days);
    state.grant_access(user_id, &[], now).await;
    Ok((StatusCode::CREATED, Json(subscription)))
}

#[derive(Debug, Deserialize)]
pub struct ActiveFlag {
    pub is_active: bool,
}

pub async fn set_user_active(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<ActiveFlag>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.users.set_active(user_id, req.is_active).await?))
}
