//! Telegram Bot API backed [`Messenger`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capabilities::Messenger;
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct TelegramMessenger {
    client: reqwest::Client,
    base_url: String,
    invoice_currency: String,
}

impl TelegramMessenger {
    pub fn new(bot_token: &str) -> BillingResult<Self> {
        if bot_token.is_empty() {
            return Err(BillingError::Configuration(
                "bot token is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BillingError::upstream(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            invoice_currency: "XTR".to_string(),
        })
    }

    async fn call(&self, method: &str, body: Value) -> BillingResult<Value> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::upstream(format!("telegram {method}: {e}")))?;

        let status = response.status();
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| BillingError::upstream(format!("telegram {method} body: {e}")))?;

        let ok = parsed.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !status.is_success() || !ok {
            let description = parsed
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(BillingError::upstream(format!(
                "telegram {method} failed ({status}): {description}"
            )));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_message(&self, chat_id: i64, text: &str) -> BillingResult<()> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_invoice_link(
        &self,
        title: &str,
        description: &str,
        payload: &str,
        amount: i64,
    ) -> BillingResult<String> {
        let parsed = self
            .call(
                "createInvoiceLink",
                json!({
                    "title": title,
                    "description": description,
                    "payload": payload,
                    "currency": self.invoice_currency,
                    "prices": [{"label": title, "amount": amount}],
                }),
            )
            .await?;

        parsed
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BillingError::upstream("createInvoiceLink returned no link".to_string()))
    }

    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        ok: bool,
        reason: Option<&str>,
    ) -> BillingResult<()> {
        let mut body = json!({
            "pre_checkout_query_id": query_id,
            "ok": ok,
        });
        if let Some(reason) = reason {
            body["error_message"] = json!(reason);
        }
        self.call("answerPreCheckoutQuery", body).await?;
        Ok(())
    }
}
