//! Route tree.

mod payments;
mod referrals;
mod stars;

use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::require_service_token;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/payments/create", post(payments::create))
        .route("/payments/confirm", post(payments::confirm))
        .route("/referral/use", post(referrals::use_referral))
        .route("/stars/invoices", post(stars::create_invoice))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_service_token,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/payments/public/create", post(payments::public_create))
        .route("/payments/webhook", post(payments::webhook))
        .merge(internal)
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
