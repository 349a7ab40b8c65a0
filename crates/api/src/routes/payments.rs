//! Payment endpoints: creation, synchronous confirmation and the gateway
//! webhook.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use keygate_billing::models::normalise_username;
use keygate_billing::{BillingError, PaymentStatus, WebhookOutcome};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Signature header candidates, checked in order. Gateways have renamed
/// this header across versions.
const SIGNATURE_HEADERS: &[&str] = &["x-signature", "x-sign", "signature"];

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub username: String,
    pub chat_id: Option<i64>,
    pub plan: String,
    pub amount: Option<i64>,
    pub referrer: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreatePaymentRequest>,
) -> ApiResult<Json<Value>> {
    create_with_source(state, body, "api").await
}

#[derive(Debug, Deserialize)]
pub struct PublicCreateRequest {
    pub username: String,
    pub plan: String,
}

/// Unauthenticated checkout entry point. The amount always comes from the
/// configured plan table; a public caller never prices its own order.
pub async fn public_create(
    State(state): State<AppState>,
    Json(body): Json<PublicCreateRequest>,
) -> ApiResult<Json<Value>> {
    create_with_source(
        state,
        CreatePaymentRequest {
            username: body.username,
            chat_id: None,
            plan: body.plan,
            amount: None,
            referrer: None,
        },
        "public",
    )
    .await
}

async fn create_with_source(
    state: AppState,
    body: CreatePaymentRequest,
    source: &str,
) -> ApiResult<Json<Value>> {
    let username = normalise_username(&body.username)
        .ok_or_else(|| ApiError::bad_request("username must not be empty"))?;
    let plan = state.plans.get(&body.plan).map_err(BillingError::from)?;
    let amount = state
        .plans
        .resolve_amount(&plan.code, body.amount)
        .map_err(BillingError::from)?;

    let payment_id = format!("pay-{}", Uuid::new_v4());
    let order_id = format!("ord-{}", Uuid::new_v4());

    // Create the hosted invoice first so the ledger row already carries the
    // checkout URL; an upstream failure here leaves no dangling record.
    let invoice = match &state.gateway {
        Some(gateway) => Some(
            gateway
                .create_invoice(&order_id, amount, "RUB", &plan.title)
                .await?,
        ),
        None => None,
    };

    let record = state
        .payments
        .create_payment(keygate_billing::payments::NewPayment {
            payment_id,
            order_id,
            username,
            chat_id: body.chat_id,
            plan_code: plan.code.clone(),
            amount,
            currency: "RUB".to_string(),
            provider: invoice.as_ref().map(|_| "cardgw".to_string()),
            provider_payment_id: invoice
                .as_ref()
                .and_then(|i| i.provider_payment_id.clone()),
            payment_url: invoice.as_ref().map(|i| i.payment_url.clone()),
            source: source.to_string(),
            referrer: body.referrer,
        })
        .await?;

    Ok(Json(json!({
        "ok": true,
        "payment_id": record.payment_id,
        "order_id": record.order_id,
        "status": record.status,
        "payment_url": record.payment_url,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub payment_id: String,
    pub plan: Option<String>,
    pub amount: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

/// Synchronous confirmation for providers that deliver no webhook (in-chat
/// payments confirm inline). Idempotent like the webhook apply step.
pub async fn confirm(
    State(state): State<AppState>,
    Json(body): Json<ConfirmPaymentRequest>,
) -> ApiResult<Json<Value>> {
    let payment = state
        .payments
        .get_payment(&body.payment_id)
        .await?
        .ok_or_else(|| BillingError::not_found(format!("payment {}", body.payment_id)))?;

    // A caller naming a different plan than the ledger row is a correlation
    // bug on its side, never a silent entitlement change on ours.
    if let Some(plan) = &body.plan {
        if *plan != payment.plan_code {
            return Err(ApiError::bad_request(format!(
                "plan {plan} does not match payment plan {}",
                payment.plan_code
            )));
        }
    }
    // Amount disagreement is logged and accepted.
    state
        .plans
        .resolve_amount(&payment.plan_code, body.amount)
        .map_err(BillingError::from)?;

    if payment.status == PaymentStatus::Paid {
        let expires_at = match payment.key_uuid {
            Some(uuid) => state
                .keys
                .get_key_by_uuid(uuid)
                .await?
                .map(|key| key.expires_at),
            None => None,
        };
        return Ok(Json(json!({
            "ok": true,
            "status": payment.status,
            "key_uuid": payment.key_uuid,
            "expires_at": expires_at.map(|t| t.to_string()),
        })));
    }

    let paid_at = body.paid_at.unwrap_or_else(OffsetDateTime::now_utc);
    let (confirmed, (key_uuid, expires_at)) =
        state.reconciler.apply_success(&payment, paid_at).await?;

    Ok(Json(json!({
        "ok": true,
        "status": confirmed.status,
        "key_uuid": key_uuid,
        "expires_at": expires_at.to_string(),
    })))
}

/// Gateway webhook. Any terminal outcome answers 200 so the provider stops
/// re-delivering; only authentication and malformed identifiers get a 4xx.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let outcome = state.reconciler.process(&body, signature).await?;

    let response = match outcome {
        WebhookOutcome::Applied {
            order_id,
            key_uuid,
            expires_at,
        } => json!({
            "ok": true,
            "order_id": order_id,
            "key_uuid": key_uuid,
            "expires_at": expires_at.to_string(),
        }),
        WebhookOutcome::AlreadyPaid { order_id, key_uuid } => json!({
            "ok": true,
            "order_id": order_id,
            "key_uuid": key_uuid,
            "already_processed": true,
        }),
        WebhookOutcome::Ignored { order_id, status } => json!({
            "ok": true,
            "order_id": order_id,
            "ignored": true,
            "status": status,
        }),
        WebhookOutcome::UnknownPayment { order_id } => json!({
            "ok": false,
            "order_id": order_id,
            "error": "payment_not_found",
        }),
    };

    Ok(Json(response))
}
