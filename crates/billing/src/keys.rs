//! VPN key issuance, renewal, expiry queries and deactivation.

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::links::AccessLinkBuilder;
use crate::models::VpnKey;

/// Fields for a fresh key record. The store assigns nothing; the caller owns
/// identifier and link construction.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub uuid: Uuid,
    pub username: String,
    pub chat_id: Option<i64>,
    pub link: String,
    pub label: String,
    pub expires_at: OffsetDateTime,
    pub trial: bool,
    pub is_subscription: bool,
}

/// Owns VPN key records.
///
/// Implementations must make `extend_active_key` atomic per username and must
/// refuse to create a second active key for the same username, so that two
/// concurrent renewals cannot both take the create branch.
#[async_trait]
pub trait SubscriptionKeyStore: Send + Sync {
    /// Persist a new active key. Fails with [`BillingError::Conflict`] when an
    /// active key already exists for the username.
    async fn create_key(&self, key: NewKey) -> BillingResult<VpnKey>;

    /// Extend the active key for a username by `days`, measured from
    /// `max(expires_at, now)`. Returns `None` when no active key exists.
    async fn extend_active_key(&self, username: &str, days: i64) -> BillingResult<Option<VpnKey>>;

    async fn get_active_key(&self, username: &str) -> BillingResult<Option<VpnKey>>;

    async fn get_key_by_uuid(&self, uuid: Uuid) -> BillingResult<Option<VpnKey>>;

    /// All keys with `active = true` and `expires_at <= now`.
    async fn list_expired(&self, now: OffsetDateTime) -> BillingResult<Vec<VpnKey>>;

    /// Set `active = false`. Idempotent; deactivating an inactive key is a no-op.
    async fn deactivate(&self, uuid: Uuid) -> BillingResult<()>;
}

/// Postgres-backed key store. Every mutation is a single conditional
/// statement; the partial unique index on `(username) WHERE active` is what
/// serialises concurrent extend-or-create races.
#[derive(Clone)]
pub struct PgSubscriptionKeyStore {
    pool: PgPool,
}

impl PgSubscriptionKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionKeyStore for PgSubscriptionKeyStore {
    async fn create_key(&self, key: NewKey) -> BillingResult<VpnKey> {
        let inserted: Option<VpnKey> = sqlx::query_as(
            r#"
            INSERT INTO vpn_keys
                (uuid, username, chat_id, link, label, issued_at, expires_at, active, trial, is_subscription)
            VALUES ($1, $2, $3, $4, $5, NOW(), $6, TRUE, $7, $8)
            ON CONFLICT (username) WHERE active DO NOTHING
            RETURNING uuid, username, chat_id, link, label, issued_at, expires_at, active, trial, is_subscription
            "#,
        )
        .bind(key.uuid)
        .bind(&key.username)
        .bind(key.chat_id)
        .bind(&key.link)
        .bind(&key.label)
        .bind(key.expires_at)
        .bind(key.trial)
        .bind(key.is_subscription)
        .fetch_optional(&self.pool)
        .await?;

        inserted.ok_or_else(|| {
            BillingError::Conflict(format!("active key already exists for {}", key.username))
        })
    }

    async fn extend_active_key(&self, username: &str, days: i64) -> BillingResult<Option<VpnKey>> {
        let updated: Option<VpnKey> = sqlx::query_as(
            r#"
            UPDATE vpn_keys
            SET expires_at = GREATEST(expires_at, NOW()) + make_interval(days => $2::int)
            WHERE username = $1 AND active
            RETURNING uuid, username, chat_id, link, label, issued_at, expires_at, active, trial, is_subscription
            "#,
        )
        .bind(username)
        .bind(days as i32)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(key) = &updated {
            tracing::info!(
                username = username,
                uuid = %key.uuid,
                days = days,
                expires_at = %key.expires_at,
                "Extended active key"
            );
        }
        Ok(updated)
    }

    async fn get_active_key(&self, username: &str) -> BillingResult<Option<VpnKey>> {
        let key = sqlx::query_as(
            "SELECT uuid, username, chat_id, link, label, issued_at, expires_at, active, trial, is_subscription \
             FROM vpn_keys WHERE username = $1 AND active",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn get_key_by_uuid(&self, uuid: Uuid) -> BillingResult<Option<VpnKey>> {
        let key = sqlx::query_as(
            "SELECT uuid, username, chat_id, link, label, issued_at, expires_at, active, trial, is_subscription \
             FROM vpn_keys WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn list_expired(&self, now: OffsetDateTime) -> BillingResult<Vec<VpnKey>> {
        let keys = sqlx::query_as(
            "SELECT uuid, username, chat_id, link, label, issued_at, expires_at, active, trial, is_subscription \
             FROM vpn_keys WHERE active AND expires_at <= $1 ORDER BY expires_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn deactivate(&self, uuid: Uuid) -> BillingResult<()> {
        let result = sqlx::query("UPDATE vpn_keys SET active = FALSE WHERE uuid = $1 AND active")
            .bind(uuid)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::info!(uuid = %uuid, "Deactivated VPN key");
        }
        Ok(())
    }
}

/// The renewal policy: extend the subscriber's active key, or issue a fresh
/// one when none exists. Both the webhook apply step and the referral engine
/// go through here so the extend-or-create branch lives in one place.
pub async fn issue_or_extend(
    store: &dyn SubscriptionKeyStore,
    links: &AccessLinkBuilder,
    username: &str,
    chat_id: Option<i64>,
    days: i64,
    is_subscription: bool,
) -> BillingResult<VpnKey> {
    if let Some(key) = store.extend_active_key(username, days).await? {
        return Ok(key);
    }

    let uuid = Uuid::new_v4();
    let label = format!("KEYGATE_{username}");
    let key = NewKey {
        uuid,
        username: username.to_string(),
        chat_id,
        link: links.build(uuid, &label),
        label,
        expires_at: OffsetDateTime::now_utc() + Duration::days(days),
        trial: false,
        is_subscription,
    };

    match store.create_key(key).await {
        Ok(created) => {
            tracing::info!(username = username, uuid = %created.uuid, days = days, "Issued new VPN key");
            Ok(created)
        }
        // Lost the create race to a concurrent renewal; the extend must now succeed.
        Err(BillingError::Conflict(_)) => store
            .extend_active_key(username, days)
            .await?
            .ok_or_else(|| BillingError::Conflict(format!("active key flapping for {username}"))),
        Err(err) => Err(err),
    }
}
