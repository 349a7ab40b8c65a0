//! Side-effect capabilities behind trait seams.
//!
//! Everything that leaves the process — messenger delivery, proxy server
//! administration — sits behind one of these traits so the reconciler,
//! monitor and scheduler can be exercised against in-memory doubles.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;

/// Delivers user-facing messages and invoice flows.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> BillingResult<()>;

    /// Create a payment invoice link priced in the messenger's own currency.
    /// Returns the URL the user opens to pay.
    async fn create_invoice_link(
        &self,
        title: &str,
        description: &str,
        payload: &str,
        amount: i64,
    ) -> BillingResult<String>;

    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        ok: bool,
        reason: Option<&str>,
    ) -> BillingResult<()>;
}

/// One client identity on the proxy server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSpec {
    pub id: Uuid,
    pub label: String,
}

/// Administers client identities on the proxy server.
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Install or refresh client identities. Idempotent on the server side;
    /// applying the same identity twice is harmless.
    async fn apply_client_set(&self, clients: &[ClientSpec]) -> BillingResult<()>;

    /// Remove a client identity. Removing an absent identity is a no-op.
    async fn remove_client(&self, id: Uuid) -> BillingResult<()>;
}
