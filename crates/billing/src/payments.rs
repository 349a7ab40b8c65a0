//! Payment records and their state machine.
//!
//! `confirm_payment` is the single mutation point for the `pending -> paid`
//! transition. It is a conditional update guarded by the current status, so
//! concurrent or repeated confirmations for the same order converge on one
//! outcome and replays observe the original result.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{PaymentRecord, PaymentStatus};

/// Fields for a new pending payment. Plan validation happens in the caller
/// against the configured plan table before this is constructed.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub payment_id: String,
    pub order_id: String,
    pub username: String,
    pub chat_id: Option<i64>,
    pub plan_code: String,
    pub amount: i64,
    pub currency: String,
    pub provider: Option<String>,
    pub provider_payment_id: Option<String>,
    pub payment_url: Option<String>,
    pub source: String,
    pub referrer: Option<String>,
}

/// Owns payment records.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn create_payment(&self, payment: NewPayment) -> BillingResult<PaymentRecord>;

    async fn get_payment(&self, payment_id: &str) -> BillingResult<Option<PaymentRecord>>;

    async fn get_payment_by_order_id(&self, order_id: &str)
        -> BillingResult<Option<PaymentRecord>>;

    /// Transition `pending -> paid`. Idempotent: if the record is already
    /// paid the stored record is returned unchanged and callers must treat
    /// that as success.
    async fn confirm_payment(
        &self,
        order_id: &str,
        paid_at: OffsetDateTime,
        key_uuid: Uuid,
    ) -> BillingResult<PaymentRecord>;

    /// Record a non-success provider status (e.g. `expired`, `canceled`) for
    /// observability. Never touches a record that is already paid.
    async fn record_provider_status(&self, order_id: &str, status: &str) -> BillingResult<()>;
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    payment_id: String,
    order_id: String,
    username: String,
    chat_id: Option<i64>,
    plan_code: String,
    amount: i64,
    currency: String,
    status: String,
    provider: Option<String>,
    provider_payment_id: Option<String>,
    provider_status: Option<String>,
    payment_url: Option<String>,
    source: String,
    referrer: Option<String>,
    key_uuid: Option<Uuid>,
    created_at: OffsetDateTime,
    paid_at: Option<OffsetDateTime>,
}

impl From<PaymentRow> for PaymentRecord {
    fn from(row: PaymentRow) -> Self {
        PaymentRecord {
            payment_id: row.payment_id,
            order_id: row.order_id,
            username: row.username,
            chat_id: row.chat_id,
            plan_code: row.plan_code,
            amount: row.amount,
            currency: row.currency,
            status: PaymentStatus::parse(&row.status),
            provider: row.provider,
            provider_payment_id: row.provider_payment_id,
            provider_status: row.provider_status,
            payment_url: row.payment_url,
            source: row.source,
            referrer: row.referrer,
            key_uuid: row.key_uuid,
            created_at: row.created_at,
            paid_at: row.paid_at,
        }
    }
}

const PAYMENT_COLUMNS: &str = "payment_id, order_id, username, chat_id, plan_code, amount, \
     currency, status, provider, provider_payment_id, provider_status, payment_url, source, \
     referrer, key_uuid, created_at, paid_at";

/// Postgres-backed payment ledger.
#[derive(Clone)]
pub struct PgPaymentLedger {
    pool: PgPool,
}

impl PgPaymentLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentLedger for PgPaymentLedger {
    async fn create_payment(&self, payment: NewPayment) -> BillingResult<PaymentRecord> {
        let row: PaymentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments
                (payment_id, order_id, username, chat_id, plan_code, amount, currency, status,
                 provider, provider_payment_id, payment_url, source, referrer, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10, $11, $12, NOW())
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(&payment.payment_id)
        .bind(&payment.order_id)
        .bind(&payment.username)
        .bind(payment.chat_id)
        .bind(&payment.plan_code)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.provider)
        .bind(&payment.provider_payment_id)
        .bind(&payment.payment_url)
        .bind(&payment.source)
        .bind(&payment.referrer)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            payment_id = %row.payment_id,
            username = %row.username,
            plan = %row.plan_code,
            amount = row.amount,
            "Created payment"
        );
        Ok(row.into())
    }

    async fn get_payment(&self, payment_id: &str) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_payment_by_order_id(
        &self,
        order_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn confirm_payment(
        &self,
        order_id: &str,
        paid_at: OffsetDateTime,
        key_uuid: Uuid,
    ) -> BillingResult<PaymentRecord> {
        // Guarded by current status: a replay races harmlessly and the loser
        // falls through to the read below, observing the first writer's row.
        let updated: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET status = 'paid', paid_at = $2, key_uuid = $3, provider_status = 'paid'
            WHERE order_id = $1 AND status <> 'paid'
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(paid_at)
        .bind(key_uuid)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            tracing::info!(order_id = order_id, key_uuid = %key_uuid, "Payment marked paid");
            return Ok(row.into());
        }

        self.get_payment_by_order_id(order_id)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("payment {order_id}")))
    }

    async fn record_provider_status(&self, order_id: &str, status: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE payments SET provider_status = $2 WHERE order_id = $1 AND status <> 'paid'",
        )
        .bind(order_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
