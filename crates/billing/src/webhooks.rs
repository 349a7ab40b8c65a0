//! Webhook reconciliation.
//!
//! One state machine per inbound gateway event: authenticate, normalise,
//! correlate, apply, notify. The apply step orders its mutations so a crash
//! at any point leaves a state the next delivery converges from — the key is
//! extended before the ledger flips to `paid`, so a half-applied event is
//! still a retriable `pending` payment, never a paid payment without a key.

use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use keygate_shared::PlanTable;

use crate::capabilities::{ClientSpec, CredentialService, Messenger};
use crate::error::{BillingError, BillingResult};
use crate::keys::{issue_or_extend, SubscriptionKeyStore};
use crate::links::AccessLinkBuilder;
use crate::models::{PaymentRecord, PaymentStatus};
use crate::normalize::WebhookEvent;
use crate::payments::PaymentLedger;
use crate::referrals::ReferralBonusEngine;
use crate::signature::verify_webhook_signature;

/// Terminal outcome of one webhook delivery. Every variant maps to an HTTP
/// success response; the provider only sees an error for authentication or
/// malformed-identifier failures.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// The payment transitioned to paid and the key was issued or extended.
    Applied {
        order_id: String,
        key_uuid: Uuid,
        expires_at: OffsetDateTime,
    },
    /// A replay of an already-fulfilled payment; the stored outcome.
    AlreadyPaid {
        order_id: String,
        key_uuid: Option<Uuid>,
    },
    /// Event status does not denote success; recorded, nothing mutated.
    Ignored { order_id: String, status: String },
    /// No ledger row matches the order reference.
    UnknownPayment { order_id: String },
}

#[derive(Clone)]
pub struct WebhookReconciler {
    secret: String,
    payments: Arc<dyn PaymentLedger>,
    keys: Arc<dyn SubscriptionKeyStore>,
    referrals: ReferralBonusEngine,
    plans: Arc<PlanTable>,
    links: AccessLinkBuilder,
    messenger: Option<Arc<dyn Messenger>>,
    credentials: Option<Arc<dyn CredentialService>>,
}

impl WebhookReconciler {
    pub fn new(
        secret: impl Into<String>,
        payments: Arc<dyn PaymentLedger>,
        keys: Arc<dyn SubscriptionKeyStore>,
        referrals: ReferralBonusEngine,
        plans: Arc<PlanTable>,
        links: AccessLinkBuilder,
        messenger: Option<Arc<dyn Messenger>>,
        credentials: Option<Arc<dyn CredentialService>>,
    ) -> Self {
        Self {
            secret: secret.into(),
            payments,
            keys,
            referrals,
            plans,
            links,
            messenger,
            credentials,
        }
    }

    /// Run the full machine for one delivery. `signature` is the value of the
    /// provider's signature header over the raw body bytes.
    pub async fn process(&self, body: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        verify_webhook_signature(&self.secret, body, signature)?;

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| BillingError::validation(format!("webhook body is not JSON: {e}")))?;
        let event = WebhookEvent::from_payload(&payload)?;

        self.reconcile(&event).await
    }

    /// Correlate and apply an already-normalised event.
    pub async fn reconcile(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let Some(payment) = self.payments.get_payment_by_order_id(&event.order_id).await? else {
            tracing::warn!(order_id = %event.order_id, "Webhook for unknown payment");
            return Ok(WebhookOutcome::UnknownPayment {
                order_id: event.order_id.clone(),
            });
        };

        if !event.is_success() {
            let status = event.status.clone().unwrap_or_else(|| "unknown".to_string());
            tracing::info!(
                order_id = %event.order_id,
                provider_status = %status,
                "Ignoring non-success webhook"
            );
            self.payments
                .record_provider_status(&event.order_id, &status)
                .await?;
            return Ok(WebhookOutcome::Ignored {
                order_id: event.order_id.clone(),
                status,
            });
        }

        if payment.status == PaymentStatus::Paid {
            tracing::info!(order_id = %event.order_id, "Replay of fulfilled payment");
            return Ok(WebhookOutcome::AlreadyPaid {
                order_id: payment.order_id,
                key_uuid: payment.key_uuid,
            });
        }

        if let Some(amount) = event.amount {
            // Logged only; entitlement duration never follows the wire amount.
            if amount != payment.amount {
                tracing::warn!(
                    order_id = %event.order_id,
                    expected = payment.amount,
                    received = amount,
                    "Webhook amount disagrees with ledger"
                );
            }
        }

        let paid_at = event.paid_at.unwrap_or_else(OffsetDateTime::now_utc);
        let (confirmed, key) = self.apply_success(&payment, paid_at).await?;

        self.notify_paid(&confirmed).await;

        Ok(WebhookOutcome::Applied {
            order_id: confirmed.order_id,
            key_uuid: key.0,
            expires_at: key.1,
        })
    }

    /// The apply step, shared with the synchronous confirmation path. Each
    /// sub-operation is idempotent, so re-running after a partial crash
    /// converges without duplicate issuance or duplicate bonuses.
    pub async fn apply_success(
        &self,
        payment: &PaymentRecord,
        paid_at: OffsetDateTime,
    ) -> BillingResult<(PaymentRecord, (Uuid, OffsetDateTime))> {
        let plan = self.plans.get(&payment.plan_code)?;

        let key = issue_or_extend(
            self.keys.as_ref(),
            &self.links,
            &payment.username,
            payment.chat_id,
            plan.duration_days,
            plan.is_subscription,
        )
        .await?;

        // Proxy-side install is best effort; the ledger row is authoritative
        // and a failed install self-heals on the next full config rebuild.
        if let Some(credentials) = &self.credentials {
            let spec = ClientSpec {
                id: key.uuid,
                label: key.label.clone(),
            };
            if let Err(err) = credentials.apply_client_set(&[spec]).await {
                tracing::warn!(order_id = %payment.order_id, uuid = %key.uuid, error = %err, "Proxy credential install failed");
            }
        }

        let confirmed = self
            .payments
            .confirm_payment(&payment.order_id, paid_at, key.uuid)
            .await?;

        // Bonus failures must not fail an already-committed ledger change;
        // the grant retries on the next delivery of this order.
        if let Err(err) = self.referrals.award_if_eligible(&payment.username).await {
            tracing::error!(
                order_id = %payment.order_id,
                username = %payment.username,
                error = %err,
                "Referral bonus grant failed"
            );
        }

        Ok((confirmed, (key.uuid, key.expires_at)))
    }

    async fn notify_paid(&self, payment: &PaymentRecord) {
        let (Some(messenger), Some(chat_id)) = (&self.messenger, payment.chat_id) else {
            return;
        };

        let key = match self.keys.get_active_key(&payment.username).await {
            Ok(Some(key)) => key,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(order_id = %payment.order_id, error = %err, "Key lookup for notification failed");
                return;
            }
        };

        let text = format!(
            "Оплата получена ✅\nКлюч действует до {}.\n\n<code>{}</code>",
            key.expires_at.date(),
            key.link
        );
        if let Err(err) = messenger.send_message(chat_id, &text).await {
            tracing::warn!(
                order_id = %payment.order_id,
                chat_id = chat_id,
                error = %err,
                "Payment confirmation message failed"
            );
        }
    }
}
