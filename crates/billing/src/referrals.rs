//! Referral links and one-time bonus grants.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};
use crate::keys::{issue_or_extend, SubscriptionKeyStore};
use crate::links::AccessLinkBuilder;

/// Owns the referral graph and bonus grant records.
#[async_trait]
pub trait ReferralLedger: Send + Sync {
    /// Who referred this username, if anyone.
    async fn referrer_of(&self, referee: &str) -> BillingResult<Option<String>>;

    /// Record that `referrer` invited `referee`. Fails with
    /// [`BillingError::Conflict`] when a different referrer is already set;
    /// re-recording the same pair is a no-op returning `false`.
    async fn record_referral(
        &self,
        referrer: &str,
        referee: &str,
        chat_id: Option<i64>,
    ) -> BillingResult<bool>;

    async fn bonus_exists(&self, referrer: &str, referee: &str) -> BillingResult<bool>;

    /// Insert the bonus grant record. Returns `false` when the (referrer,
    /// referee) pair already has one — the uniqueness constraint, not the key
    /// extension, is the idempotency guard.
    async fn record_bonus(
        &self,
        referrer: &str,
        referee: &str,
        bonus_days: i64,
    ) -> BillingResult<bool>;
}

#[derive(Clone)]
pub struct PgReferralLedger {
    pool: PgPool,
}

impl PgReferralLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferralLedger for PgReferralLedger {
    async fn referrer_of(&self, referee: &str) -> BillingResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT referrer FROM referral_links WHERE referee = $1")
                .bind(referee)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(referrer,)| referrer))
    }

    async fn record_referral(
        &self,
        referrer: &str,
        referee: &str,
        chat_id: Option<i64>,
    ) -> BillingResult<bool> {
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO referral_links (referee, referrer, chat_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (referee) DO NOTHING
            RETURNING referrer
            "#,
        )
        .bind(referee)
        .bind(referrer)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(true);
        }

        match self.referrer_of(referee).await? {
            Some(existing) if existing == referrer => Ok(false),
            Some(existing) => Err(BillingError::Conflict(format!(
                "referee {referee} already linked to {existing}"
            ))),
            None => Err(BillingError::not_found(format!("referral link for {referee}"))),
        }
    }

    async fn bonus_exists(&self, referrer: &str, referee: &str) -> BillingResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM referral_bonuses WHERE referrer = $1 AND referee = $2",
        )
        .bind(referrer)
        .bind(referee)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn record_bonus(
        &self,
        referrer: &str,
        referee: &str,
        bonus_days: i64,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO referral_bonuses (referrer, referee, bonus_days)
            VALUES ($1, $2, $3)
            ON CONFLICT (referrer, referee) DO NOTHING
            "#,
        )
        .bind(referrer)
        .bind(referee)
        .bind(bonus_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Awards a one-time bonus extension to a referrer when a referee's payment
/// is fulfilled.
#[derive(Clone)]
pub struct ReferralBonusEngine {
    referrals: Arc<dyn ReferralLedger>,
    keys: Arc<dyn SubscriptionKeyStore>,
    links: AccessLinkBuilder,
    bonus_days: i64,
}

impl ReferralBonusEngine {
    pub fn new(
        referrals: Arc<dyn ReferralLedger>,
        keys: Arc<dyn SubscriptionKeyStore>,
        links: AccessLinkBuilder,
        bonus_days: i64,
    ) -> Self {
        Self {
            referrals,
            keys,
            links,
            bonus_days,
        }
    }

    /// No-op when the referee has no recorded referrer or the pair already
    /// has a bonus. Otherwise extend (or issue) the referrer's key, then
    /// insert the bonus record. A crash between the two leaves the bonus
    /// record missing, so the next invocation retries the extension; the
    /// resulting rare over-grant is bounded and accepted, a missed bonus is
    /// not.
    pub async fn award_if_eligible(&self, referee: &str) -> BillingResult<bool> {
        let Some(referrer) = self.referrals.referrer_of(referee).await? else {
            return Ok(false);
        };

        if self.referrals.bonus_exists(&referrer, referee).await? {
            tracing::debug!(
                referrer = %referrer,
                referee = referee,
                "Referral bonus already granted"
            );
            return Ok(false);
        }

        issue_or_extend(
            self.keys.as_ref(),
            &self.links,
            &referrer,
            None,
            self.bonus_days,
            false,
        )
        .await?;

        let recorded = self
            .referrals
            .record_bonus(&referrer, referee, self.bonus_days)
            .await?;

        if recorded {
            tracing::info!(
                referrer = %referrer,
                referee = referee,
                bonus_days = self.bonus_days,
                "Awarded referral bonus"
            );
        }
        Ok(recorded)
    }
}
