//! Referral link registration.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use keygate_billing::models::normalise_username;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UseReferralRequest {
    pub referrer: String,
    pub referee: String,
    pub chat_id: Option<i64>,
}

/// Record that `referee` arrived through `referrer`'s link. Self-referral is
/// rejected; re-registering the same pair is reported as already linked.
pub async fn use_referral(
    State(state): State<AppState>,
    Json(body): Json<UseReferralRequest>,
) -> ApiResult<Json<Value>> {
    let referrer = normalise_username(&body.referrer)
        .ok_or_else(|| ApiError::bad_request("referrer must not be empty"))?;
    let referee = normalise_username(&body.referee)
        .ok_or_else(|| ApiError::bad_request("referee must not be empty"))?;

    if referrer == referee {
        return Err(ApiError::bad_request("self-referral is not allowed"));
    }

    let created = state
        .referrals
        .record_referral(&referrer, &referee, body.chat_id)
        .await?;

    if created {
        tracing::info!(referrer = %referrer, referee = %referee, "Recorded referral link");
    }
    Ok(Json(json!({"ok": true, "created": created})))
}
