//! Renewal reminder chains.
//!
//! A chain is three staged messages per expired key. All progress lives in
//! the `renewal_notifications` table (`stage`, `next_attempt_at`), so a
//! process restart resumes mid-chain with no recovery path.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::capabilities::Messenger;
use crate::error::{BillingError, BillingResult};
use crate::models::{RenewalJob, RENEWAL_STAGE_COUNT};

/// Owns renewal notification jobs.
#[async_trait]
pub trait NotificationJobStore: Send + Sync {
    /// Create a chain for a key expiry. Idempotent: while an incomplete
    /// chain exists for `key_uuid` the call is a no-op returning `false`.
    async fn schedule(
        &self,
        key_uuid: Uuid,
        chat_id: Option<i64>,
        username: Option<&str>,
        expires_at: Option<OffsetDateTime>,
        first_attempt_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Incomplete jobs with `next_attempt_at <= now`, oldest first, at most
    /// `limit` of them.
    async fn due_jobs(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<RenewalJob>>;

    /// Advance a job after successful delivery.
    async fn mark_sent(
        &self,
        id: i64,
        new_stage: i16,
        completed: bool,
        sent_at: OffsetDateTime,
        next_attempt_at: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Record a failure and schedule a retry of the same stage.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Complete a job without delivery (nothing deliverable).
    async fn mark_completed(&self, id: i64) -> BillingResult<()>;
}

#[derive(Clone)]
pub struct PgNotificationJobStore {
    pool: PgPool,
}

impl PgNotificationJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const JOB_COLUMNS: &str = "id, key_uuid, chat_id, username, expires_at, stage, completed, \
     last_sent_at, next_attempt_at, last_error";

#[async_trait]
impl NotificationJobStore for PgNotificationJobStore {
    async fn schedule(
        &self,
        key_uuid: Uuid,
        chat_id: Option<i64>,
        username: Option<&str>,
        expires_at: Option<OffsetDateTime>,
        first_attempt_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        // The partial unique index on (key_uuid) WHERE NOT completed absorbs
        // re-scheduling attempts while a chain is in flight.
        let result = sqlx::query(
            r#"
            INSERT INTO renewal_notifications
                (key_uuid, chat_id, username, expires_at, stage, completed, next_attempt_at)
            VALUES ($1, $2, $3, $4, 0, FALSE, $5)
            ON CONFLICT (key_uuid) WHERE NOT completed DO NOTHING
            "#,
        )
        .bind(key_uuid)
        .bind(chat_id)
        .bind(username)
        .bind(expires_at)
        .bind(first_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_jobs(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<RenewalJob>> {
        let jobs = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM renewal_notifications \
             WHERE NOT completed AND next_attempt_at <= $1 \
             ORDER BY next_attempt_at LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn mark_sent(
        &self,
        id: i64,
        new_stage: i16,
        completed: bool,
        sent_at: OffsetDateTime,
        next_attempt_at: OffsetDateTime,
    ) -> BillingResult<()> {
        // stage only increases; the guard makes a racing duplicate harmless.
        sqlx::query(
            r#"
            UPDATE renewal_notifications
            SET stage = $2, completed = $3, last_sent_at = $4, next_attempt_at = $5,
                last_error = NULL
            WHERE id = $1 AND stage < $2
            "#,
        )
        .bind(id)
        .bind(new_stage)
        .bind(completed)
        .bind(sent_at)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE renewal_notifications SET last_error = $2, next_attempt_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: i64) -> BillingResult<()> {
        sqlx::query("UPDATE renewal_notifications SET completed = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Produces the text for a given reminder stage. Empty text is a generation
/// failure; the scheduler retries the stage later.
#[async_trait]
pub trait ReminderTextSource: Send + Sync {
    async fn reminder_text(&self, stage: i16, username: Option<&str>) -> BillingResult<String>;
}

/// Fixed message templates, one per stage, escalating in urgency.
#[derive(Debug, Clone, Default)]
pub struct TemplateReminderTexts;

#[async_trait]
impl ReminderTextSource for TemplateReminderTexts {
    async fn reminder_text(&self, stage: i16, username: Option<&str>) -> BillingResult<String> {
        let greeting = username
            .map(|name| format!("@{name}, "))
            .unwrap_or_default();
        let body = match stage {
            1 => "срок действия вашего VPN-ключа истёк. Продлите подписку, чтобы восстановить доступ.",
            2 => "напоминаем: ваш VPN-ключ всё ещё не продлён. Доступ восстановится сразу после оплаты.",
            3 => "последнее напоминание — ключ будет окончательно удалён. Продлите подписку, чтобы сохранить его.",
            other => {
                return Err(BillingError::validation(format!(
                    "no reminder template for stage {other}"
                )))
            }
        };
        Ok(format!("{greeting}{body}"))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub notification_interval: Duration,
    pub retry_interval: Duration,
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            notification_interval: Duration::hours(24),
            retry_interval: Duration::hours(1),
            batch_size: 10,
        }
    }
}

/// Drives renewal jobs through stages 1 → 2 → 3.
#[derive(Clone)]
pub struct RenewalNotificationScheduler {
    jobs: Arc<dyn NotificationJobStore>,
    messenger: Arc<dyn Messenger>,
    texts: Arc<dyn ReminderTextSource>,
    config: SchedulerConfig,
}

impl RenewalNotificationScheduler {
    pub fn new(
        jobs: Arc<dyn NotificationJobStore>,
        messenger: Arc<dyn Messenger>,
        texts: Arc<dyn ReminderTextSource>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            messenger,
            texts,
            config,
        }
    }

    /// One sweep over due jobs. Per-job failures are isolated; returns the
    /// number of messages delivered.
    pub async fn run_once(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let due = self.jobs.due_jobs(now, self.config.batch_size).await?;
        let mut delivered = 0;

        for job in due {
            match self.advance(&job, now).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(job_id = job.id, key_uuid = %job.key_uuid, error = %err, "Renewal job sweep error");
                }
            }
        }

        if delivered > 0 {
            tracing::info!(delivered = delivered, "Renewal reminder sweep complete");
        }
        Ok(delivered)
    }

    async fn advance(&self, job: &RenewalJob, now: OffsetDateTime) -> BillingResult<bool> {
        let Some(chat_id) = job.chat_id else {
            // Nothing deliverable; close the chain.
            self.jobs.mark_completed(job.id).await?;
            return Ok(false);
        };

        if job.stage >= RENEWAL_STAGE_COUNT {
            self.jobs.mark_completed(job.id).await?;
            return Ok(false);
        }

        let next_stage = job.stage + 1;
        let text = match self
            .texts
            .reminder_text(next_stage, job.username.as_deref())
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                self.retry_later(job, now, "empty reminder text").await?;
                return Ok(false);
            }
            Err(err) => {
                self.retry_later(job, now, &err.to_string()).await?;
                return Ok(false);
            }
        };

        if let Err(err) = self.messenger.send_message(chat_id, &text).await {
            tracing::warn!(
                job_id = job.id,
                chat_id = chat_id,
                stage = next_stage,
                error = %err,
                "Reminder delivery failed"
            );
            self.retry_later(job, now, &err.to_string()).await?;
            return Ok(false);
        }

        let completed = next_stage >= RENEWAL_STAGE_COUNT;
        self.jobs
            .mark_sent(
                job.id,
                next_stage,
                completed,
                now,
                now + self.config.notification_interval,
            )
            .await?;

        tracing::info!(
            job_id = job.id,
            key_uuid = %job.key_uuid,
            stage = next_stage,
            completed = completed,
            "Delivered renewal reminder"
        );
        Ok(true)
    }

    async fn retry_later(
        &self,
        job: &RenewalJob,
        now: OffsetDateTime,
        error: &str,
    ) -> BillingResult<()> {
        self.jobs
            .mark_failed(job.id, error, now + self.config.retry_interval)
            .await
    }
}
