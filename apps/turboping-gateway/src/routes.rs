use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::handlers::{admin, health, internal, webhooks};
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/plans", get(internal::list_plans))
        .route("/users", post(internal::register_user))
        .route("/intents", post(internal::create_intent))
        .route("/users/{id}/trial", post(internal::grant_trial))
        .route("/users/{id}/payout", get(internal::payout_summary))
        .route("/users/{id}/payouts", post(internal::request_payout))
        .route("/users/{id}/credential", get(internal::reveal_credential))
        .route("/users/{id}/credential/rotate", post(internal::rotate_credential))
        .route("/users/{id}/region", post(internal::change_region))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_internal_token,
        ));

    let admin = Router::new()
        .route("/subscriptions/{id}/cancel", post(admin::cancel_subscription))
        .route("/payouts/{id}", post(admin::update_payout))
        .route("/users/{id}/extend", post(admin::extend_subscription))
        .route("/users/{id}/trial", post(admin::grant_trial))
        .route("/users/{id}/active", post(admin::set_user_active))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin_token,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/webhooks/{rail}", post(webhooks::payment_webhook))
        .nest("/api", api)
        .nest("/admin", admin)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
