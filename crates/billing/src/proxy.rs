//! Proxy server administration client.
//!
//! Talks to the VPN node's admin API to install and remove client identities.
//! The monitor treats failures here as best effort, so every method maps
//! transport problems to [`BillingError::Upstream`] and nothing panics.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::capabilities::{ClientSpec, CredentialService};
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct ProxyAdminClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl ProxyAdminClient {
    pub fn new(base_url: &str, api_token: &str) -> BillingResult<Self> {
        if base_url.is_empty() {
            return Err(BillingError::Configuration(
                "proxy admin URL is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BillingError::upstream(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait]
impl CredentialService for ProxyAdminClient {
    async fn apply_client_set(&self, clients: &[ClientSpec]) -> BillingResult<()> {
        let body: Vec<_> = clients
            .iter()
            .map(|c| json!({"id": c.id, "label": c.label}))
            .collect();
        let response = self
            .client
            .post(format!("{}/clients", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&json!({"clients": body}))
            .send()
            .await
            .map_err(|e| BillingError::upstream(format!("proxy apply: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::upstream(format!(
                "proxy apply failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn remove_client(&self, uuid: Uuid) -> BillingResult<()> {
        let response = self
            .client
            .delete(format!("{}/clients/{uuid}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| BillingError::upstream(format!("proxy remove: {e}")))?;

        let status = response.status();
        // Absent identity already satisfies the goal.
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::upstream(format!(
                "proxy remove failed: {status}"
            )));
        }
        Ok(())
    }
}
