//! Webhook payload normalisation.
//!
//! Gateway payload schemas drift between provider versions: fields move under
//! `data`/`object`/`payment` wrappers, get renamed, or change type. Extraction
//! therefore walks the whole JSON tree against candidate key lists instead of
//! deserialising into a fixed struct. A missing order reference is the only
//! hard failure; everything else degrades to `None`.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

const ORDER_ID_KEYS: &[&str] = &[
    "order_id",
    "orderId",
    "order",
    "external_id",
    "externalId",
    "merchant_order_id",
    "custom_id",
];

const PROVIDER_PAYMENT_ID_KEYS: &[&str] = &["payment_id", "paymentId", "id", "uuid", "invoice_id"];

const STATUS_KEYS: &[&str] = &["status", "payment_status", "state"];

const AMOUNT_KEYS: &[&str] = &["amount", "sum", "total", "price", "value"];

const CURRENCY_KEYS: &[&str] = &["currency", "currency_code"];

const PAID_AT_KEYS: &[&str] = &["paid_at", "paidAt", "completed_at", "updated_at", "timestamp"];

/// Provider statuses treated as a successful payment.
const SUCCESS_STATUSES: &[&str] = &["paid", "success", "succeeded", "completed", "done"];

/// Container keys the primary walk does not descend into. Merchant-echoed
/// metadata must not shadow the provider's own fields; only the explicit
/// order-reference fallback reads it.
const METADATA_KEYS: &[&str] = &["metadata", "meta"];

/// A gateway notification reduced to the fields the reconciler acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub order_id: String,
    pub provider_payment_id: Option<String>,
    pub status: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
}

impl WebhookEvent {
    pub fn is_success(&self) -> bool {
        self.status
            .as_deref()
            .map(|status| SUCCESS_STATUSES.contains(&status.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// Extract the event from an arbitrary payload shape. Fails with
    /// [`BillingError::Validation`] only when no order reference can be found
    /// anywhere in the tree, including under a `metadata` object.
    pub fn from_payload(payload: &Value) -> BillingResult<Self> {
        let order_id = find_string(payload, ORDER_ID_KEYS)
            .or_else(|| {
                payload
                    .get("metadata")
                    .and_then(|meta| find_string(meta, ORDER_ID_KEYS))
            })
            .ok_or_else(|| BillingError::validation("webhook payload carries no order reference"))?;

        Ok(Self {
            order_id,
            provider_payment_id: find_string(payload, PROVIDER_PAYMENT_ID_KEYS),
            status: find_string(payload, STATUS_KEYS).map(|s| s.to_lowercase()),
            amount: find_amount(payload),
            currency: find_string(payload, CURRENCY_KEYS),
            paid_at: find_timestamp(payload),
        })
    }
}

/// Depth-first search for the first non-empty string (or number rendered as a
/// string) under any of the candidate keys. Earlier keys win over deeper
/// matches of later keys at the same level, matching how providers nest the
/// authoritative field closest to the root. Metadata containers are skipped;
/// callers that want them must descend explicitly.
fn find_value<'a>(node: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    if let Value::Object(map) = node {
        for key in keys {
            if let Some(value) = map.get(*key) {
                if !value.is_null() {
                    return Some(value);
                }
            }
        }
        for (name, value) in map {
            if METADATA_KEYS.contains(&name.as_str()) {
                continue;
            }
            if let Some(found) = find_value(value, keys) {
                return Some(found);
            }
        }
    }
    if let Value::Array(items) = node {
        for item in items {
            if let Some(found) = find_value(item, keys) {
                return Some(found);
            }
        }
    }
    None
}

fn find_string(node: &Value, keys: &[&str]) -> Option<String> {
    match find_value(node, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Amounts arrive as integers, floats, or numeric strings. Fractional values
/// are truncated towards zero; the ledger stores whole currency units.
fn find_amount(node: &Value) -> Option<i64> {
    match find_value(node, AMOUNT_KEYS)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Timestamps arrive as unix seconds or RFC 3339 strings.
fn find_timestamp(node: &Value) -> Option<OffsetDateTime> {
    match find_value(node, PAID_AT_KEYS)? {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok()),
        Value::String(s) => {
            let trimmed = s.trim();
            OffsetDateTime::parse(trimmed, &Rfc3339).ok().or_else(|| {
                trimmed
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_payload_extracts_all_fields() {
        let event = WebhookEvent::from_payload(&json!({
            "order_id": "ord-1",
            "payment_id": "prov-9",
            "status": "PAID",
            "amount": 300,
            "currency": "RUB",
            "paid_at": 1_700_000_000,
        }))
        .unwrap();

        assert_eq!(event.order_id, "ord-1");
        assert_eq!(event.provider_payment_id.as_deref(), Some("prov-9"));
        assert!(event.is_success());
        assert_eq!(event.amount, Some(300));
        assert_eq!(
            event.paid_at,
            Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap())
        );
    }

    #[test]
    fn nested_payload_is_searched_depth_first() {
        let event = WebhookEvent::from_payload(&json!({
            "event": "payment.updated",
            "data": {
                "object": {
                    "orderId": "ord-2",
                    "state": "succeeded",
                    "total": "800.00",
                }
            }
        }))
        .unwrap();

        assert_eq!(event.order_id, "ord-2");
        assert!(event.is_success());
        assert_eq!(event.amount, Some(800));
    }

    #[test]
    fn metadata_fallback_recovers_order_id() {
        let event = WebhookEvent::from_payload(&json!({
            "id": "prov-3",
            "status": "completed",
            "metadata": {"order_id": "ord-3"},
        }))
        .unwrap();

        assert_eq!(event.order_id, "ord-3");
    }

    #[test]
    fn metadata_fields_do_not_shadow_payload_fields() {
        let event = WebhookEvent::from_payload(&json!({
            "order_id": "ord-7",
            "metadata": {"amount": 999, "status": "failed"},
            "payment": {"amount": 300, "status": "paid"},
        }))
        .unwrap();

        assert_eq!(event.amount, Some(300));
        assert!(event.is_success());
    }

    #[test]
    fn missing_order_reference_is_rejected() {
        let err = WebhookEvent::from_payload(&json!({"status": "paid", "amount": 300}))
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn non_success_statuses_are_not_success() {
        for status in ["pending", "canceled", "expired", "failed"] {
            let event = WebhookEvent::from_payload(&json!({
                "order_id": "ord-4",
                "status": status,
            }))
            .unwrap();
            assert!(!event.is_success(), "{status} must not count as success");
        }
    }

    #[test]
    fn rfc3339_timestamp_is_parsed() {
        let event = WebhookEvent::from_payload(&json!({
            "order_id": "ord-5",
            "paid_at": "2026-01-15T10:30:00Z",
        }))
        .unwrap();
        assert_eq!(
            event.paid_at.map(|t| t.unix_timestamp()),
            Some(1_768_473_000)
        );
    }
}
