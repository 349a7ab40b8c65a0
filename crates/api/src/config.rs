//! API server configuration, loaded once at startup.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Shared secret for internal service endpoints (`X-Service-Token`).
    pub service_token: String,
    /// Secret for verifying gateway webhook signatures.
    pub webhook_secret: String,
    /// Bot token for user notifications and invoice links; absent in
    /// deployments that only serve the HTTP API.
    pub bot_token: Option<String>,
}

impl Config {
    /// Fail-fast load: a missing required variable aborts startup rather
    /// than surfacing later as a request-time authentication hole.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            service_token: std::env::var("SERVICE_API_TOKEN")
                .context("SERVICE_API_TOKEN must be set")?,
            webhook_secret: std::env::var("WEBHOOK_SECRET")
                .context("WEBHOOK_SECRET must be set")?,
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }
}
