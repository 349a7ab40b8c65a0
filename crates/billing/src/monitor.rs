//! Expired key sweep.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::capabilities::CredentialService;
use crate::error::BillingResult;
use crate::keys::SubscriptionKeyStore;
use crate::notify::NotificationJobStore;

/// Deactivates keys past their expiry, removes the proxy-side credential and
/// opens a renewal reminder chain for the subscriber.
#[derive(Clone)]
pub struct ExpiredKeyMonitor {
    keys: Arc<dyn SubscriptionKeyStore>,
    credentials: Arc<dyn CredentialService>,
    jobs: Arc<dyn NotificationJobStore>,
}

impl ExpiredKeyMonitor {
    pub fn new(
        keys: Arc<dyn SubscriptionKeyStore>,
        credentials: Arc<dyn CredentialService>,
        jobs: Arc<dyn NotificationJobStore>,
    ) -> Self {
        Self {
            keys,
            credentials,
            jobs,
        }
    }

    /// One sweep. Deactivation in the ledger is authoritative; credential
    /// removal and reminder scheduling are best effort after it. Per-record
    /// failures are logged and the record is retried on the next sweep.
    /// Returns the number of keys deactivated.
    pub async fn run_once(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let expired = self.keys.list_expired(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        tracing::info!(count = expired.len(), "Expired key sweep started");
        let mut deactivated = 0;

        for key in expired {
            if let Err(err) = self.keys.deactivate(key.uuid).await {
                tracing::error!(uuid = %key.uuid, username = %key.username, error = %err, "Key deactivation failed");
                continue;
            }
            deactivated += 1;

            // Ledger state is already authoritative; a failed removal
            // self-heals on the next full proxy config rebuild.
            if let Err(err) = self.credentials.remove_client(key.uuid).await {
                tracing::warn!(uuid = %key.uuid, error = %err, "Proxy credential removal failed");
            }

            if let Err(err) = self
                .jobs
                .schedule(
                    key.uuid,
                    key.chat_id,
                    Some(key.username.as_str()),
                    Some(key.expires_at),
                    now,
                )
                .await
            {
                tracing::warn!(uuid = %key.uuid, error = %err, "Renewal chain scheduling failed");
            }
        }

        tracing::info!(deactivated = deactivated, "Expired key sweep complete");
        Ok(deactivated)
    }
}
