//! Payment gateway client.
//!
//! Creates hosted-checkout invoices at the card gateway. Response shapes vary
//! between gateway versions, so the payment URL and provider id are pulled
//! out with the same candidate-key search the webhook normaliser uses.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{BillingError, BillingResult};

const PAYMENT_URL_KEYS: &[&str] = &["payment_url", "paymentUrl", "url", "link", "checkout_url"];
const PROVIDER_ID_KEYS: &[&str] = &["payment_id", "paymentId", "id", "uuid", "invoice_id"];

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub success_url: Option<String>,
    pub fail_url: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        let api_url = std::env::var("GATEWAY_API_URL")
            .map_err(|_| BillingError::Configuration("GATEWAY_API_URL is not set".to_string()))?;
        let api_key = std::env::var("GATEWAY_API_KEY")
            .map_err(|_| BillingError::Configuration("GATEWAY_API_KEY is not set".to_string()))?;
        Ok(Self {
            api_url,
            api_key,
            success_url: std::env::var("GATEWAY_SUCCESS_URL").ok(),
            fail_url: std::env::var("GATEWAY_FAIL_URL").ok(),
        })
    }
}

/// A freshly created gateway invoice.
#[derive(Debug, Clone)]
pub struct GatewayInvoice {
    pub provider_payment_id: Option<String>,
    pub payment_url: String,
}

#[derive(Clone)]
pub struct PaymentGatewayClient {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl PaymentGatewayClient {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BillingError::upstream(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create a hosted invoice for an order. `order_id` travels both as a top
    /// level field and inside `metadata`, so webhooks can recover it from
    /// whichever spot the gateway echoes back.
    pub async fn create_invoice(
        &self,
        order_id: &str,
        amount: i64,
        currency: &str,
        description: &str,
    ) -> BillingResult<GatewayInvoice> {
        let mut body = json!({
            "amount": amount,
            "currency": currency,
            "order_id": order_id,
            "description": description,
            "metadata": {"order_id": order_id},
        });
        if let Some(url) = &self.config.success_url {
            body["success_url"] = json!(url);
        }
        if let Some(url) = &self.config.fail_url {
            body["fail_url"] = json!(url);
        }

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::upstream(format!("gateway create: {e}")))?;

        let status = response.status();
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| BillingError::upstream(format!("gateway response body: {e}")))?;

        if !status.is_success() {
            tracing::warn!(order_id = order_id, %status, "Gateway rejected invoice");
            return Err(BillingError::upstream(format!(
                "gateway returned {status}"
            )));
        }

        let payment_url = find_string(&parsed, PAYMENT_URL_KEYS).ok_or_else(|| {
            BillingError::upstream("gateway response carries no payment URL".to_string())
        })?;

        Ok(GatewayInvoice {
            provider_payment_id: find_string(&parsed, PROVIDER_ID_KEYS),
            payment_url,
        })
    }
}

fn find_string(node: &Value, keys: &[&str]) -> Option<String> {
    if let Value::Object(map) = node {
        for key in keys {
            if let Some(Value::String(s)) = map.get(*key) {
                if !s.trim().is_empty() {
                    return Some(s.trim().to_string());
                }
            }
        }
        for value in map.values() {
            if let Some(found) = find_string(value, keys) {
                return Some(found);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_url_is_found_under_wrappers() {
        let parsed = json!({"data": {"checkout_url": "https://pay.example/i/1", "id": "p-1"}});
        assert_eq!(
            find_string(&parsed, PAYMENT_URL_KEYS).as_deref(),
            Some("https://pay.example/i/1")
        );
        assert_eq!(find_string(&parsed, PROVIDER_ID_KEYS).as_deref(), Some("p-1"));
    }
}
