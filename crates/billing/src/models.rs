//! Shared record types persisted in the relational store.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of a payment. Transitions are monotonic: once `Paid`, a
/// record never moves back to `Pending` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "paid" => PaymentStatus::Paid,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        }
    }
}

/// A payment attempt. `order_id` is the idempotency key for webhook replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub order_id: String,
    pub username: String,
    pub chat_id: Option<i64>,
    pub plan_code: String,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider: Option<String>,
    pub provider_payment_id: Option<String>,
    pub provider_status: Option<String>,
    pub payment_url: Option<String>,
    pub source: String,
    pub referrer: Option<String>,
    pub key_uuid: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
}

/// A time-boxed access credential. At most one active key per username.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VpnKey {
    pub uuid: Uuid,
    pub username: String,
    pub chat_id: Option<i64>,
    pub link: String,
    pub label: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub active: bool,
    pub trial: bool,
    pub is_subscription: bool,
}

/// One-time bonus grant. Unique per (referrer, referee) pair; that uniqueness
/// is the idempotency guard for retried payment confirmations.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralBonus {
    pub referrer: String,
    pub referee: String,
    pub bonus_days: i64,
    pub granted_at: OffsetDateTime,
}

/// One step of a renewal reminder chain. `stage` only increases; the chain is
/// completed once stage 3 has been delivered.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RenewalJob {
    pub id: i64,
    pub key_uuid: Uuid,
    pub chat_id: Option<i64>,
    pub username: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub stage: i16,
    pub completed: bool,
    pub last_sent_at: Option<OffsetDateTime>,
    pub next_attempt_at: OffsetDateTime,
    pub last_error: Option<String>,
}

/// Number of reminder stages in a renewal chain.
pub const RENEWAL_STAGE_COUNT: i16 = 3;

/// Normalise a username the way every entry point must: trimmed, lowercased,
/// leading `@` stripped. Empty or whitespace-only input is rejected.
pub fn normalise_username(raw: &str) -> Option<String> {
    let cleaned = raw.trim().trim_start_matches('@').to_lowercase();
    if cleaned.is_empty() {
        return None;
    }
    Some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_normalisation() {
        assert_eq!(normalise_username(" @Alice "), Some("alice".to_string()));
        assert_eq!(normalise_username("bob"), Some("bob".to_string()));
        assert_eq!(normalise_username("   "), None);
        assert_eq!(normalise_username("@"), None);
    }
}
