//! In-chat (Telegram Stars) invoice creation.
//!
//! Stars payments confirm synchronously through `/payments/confirm`; there is
//! no asynchronous webhook for them. The ledger row is created here so the
//! later confirmation correlates by `payment_id`.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use keygate_billing::models::normalise_username;
use keygate_billing::{payments::NewPayment, BillingError};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub username: String,
    pub chat_id: i64,
    pub plan: String,
}

pub async fn create_invoice(
    State(state): State<AppState>,
    Json(body): Json<CreateInvoiceRequest>,
) -> ApiResult<Json<Value>> {
    let messenger = state.messenger.as_ref().ok_or_else(|| {
        BillingError::Configuration("messenger is not configured".to_string())
    })?;

    let username = normalise_username(&body.username)
        .ok_or_else(|| ApiError::bad_request("username must not be empty"))?;
    let plan = state.plans.get(&body.plan).map_err(BillingError::from)?;

    let payment_id = format!("pay-{}", Uuid::new_v4());
    let order_id = format!("ord-{}", Uuid::new_v4());

    // Invoice first: an upstream failure here leaves no dangling ledger row.
    let link = messenger
        .create_invoice_link(&plan.title, &plan.title, &payment_id, plan.price)
        .await?;

    let record = state
        .payments
        .create_payment(NewPayment {
            payment_id,
            order_id,
            username,
            chat_id: Some(body.chat_id),
            plan_code: plan.code.clone(),
            amount: plan.price,
            currency: "XTR".to_string(),
            provider: Some("stars".to_string()),
            provider_payment_id: None,
            payment_url: Some(link.clone()),
            source: "stars".to_string(),
            referrer: None,
        })
        .await?;

    Ok(Json(json!({
        "ok": true,
        "payment_id": record.payment_id,
        "link": link,
    })))
}
