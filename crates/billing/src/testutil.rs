#![allow(clippy::unwrap_used)]

//! In-memory collaborators for exercising the lifecycle engine without a
//! database or network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::capabilities::{ClientSpec, CredentialService, Messenger};
use crate::error::{BillingError, BillingResult};
use crate::keys::{NewKey, SubscriptionKeyStore};
use crate::models::{PaymentRecord, PaymentStatus, RenewalJob, VpnKey};
use crate::notify::NotificationJobStore;
use crate::payments::{NewPayment, PaymentLedger};
use crate::referrals::ReferralLedger;

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Vec<VpnKey>>,
}

#[async_trait]
impl SubscriptionKeyStore for MemoryKeyStore {
    async fn create_key(&self, key: NewKey) -> BillingResult<VpnKey> {
        let mut keys = self.keys.lock().unwrap();
        if keys.iter().any(|k| k.active && k.username == key.username) {
            return Err(BillingError::Conflict(format!(
                "active key already exists for {}",
                key.username
            )));
        }
        let record = VpnKey {
            uuid: key.uuid,
            username: key.username,
            chat_id: key.chat_id,
            link: key.link,
            label: key.label,
            issued_at: OffsetDateTime::now_utc(),
            expires_at: key.expires_at,
            active: true,
            trial: key.trial,
            is_subscription: key.is_subscription,
        };
        keys.push(record.clone());
        Ok(record)
    }

    async fn extend_active_key(&self, username: &str, days: i64) -> BillingResult<Option<VpnKey>> {
        let mut keys = self.keys.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        for key in keys.iter_mut() {
            if key.active && key.username == username {
                key.expires_at = key.expires_at.max(now) + Duration::days(days);
                return Ok(Some(key.clone()));
            }
        }
        Ok(None)
    }

    async fn get_active_key(&self, username: &str) -> BillingResult<Option<VpnKey>> {
        let keys = self.keys.lock().unwrap();
        Ok(keys
            .iter()
            .find(|k| k.active && k.username == username)
            .cloned())
    }

    async fn get_key_by_uuid(&self, uuid: Uuid) -> BillingResult<Option<VpnKey>> {
        let keys = self.keys.lock().unwrap();
        Ok(keys.iter().find(|k| k.uuid == uuid).cloned())
    }

    async fn list_expired(&self, now: OffsetDateTime) -> BillingResult<Vec<VpnKey>> {
        let keys = self.keys.lock().unwrap();
        Ok(keys
            .iter()
            .filter(|k| k.active && k.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn deactivate(&self, uuid: Uuid) -> BillingResult<()> {
        let mut keys = self.keys.lock().unwrap();
        for key in keys.iter_mut() {
            if key.uuid == uuid {
                key.active = false;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPaymentLedger {
    payments: Mutex<Vec<PaymentRecord>>,
}

impl MemoryPaymentLedger {
    pub fn records(&self) -> Vec<PaymentRecord> {
        self.payments.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentLedger for MemoryPaymentLedger {
    async fn create_payment(&self, payment: NewPayment) -> BillingResult<PaymentRecord> {
        let mut payments = self.payments.lock().unwrap();
        if payments.iter().any(|p| p.order_id == payment.order_id) {
            return Err(BillingError::Conflict(format!(
                "order {} already exists",
                payment.order_id
            )));
        }
        let record = PaymentRecord {
            payment_id: payment.payment_id,
            order_id: payment.order_id,
            username: payment.username,
            chat_id: payment.chat_id,
            plan_code: payment.plan_code,
            amount: payment.amount,
            currency: payment.currency,
            status: PaymentStatus::Pending,
            provider: payment.provider,
            provider_payment_id: payment.provider_payment_id,
            provider_status: None,
            payment_url: payment.payment_url,
            source: payment.source,
            referrer: payment.referrer,
            key_uuid: None,
            created_at: OffsetDateTime::now_utc(),
            paid_at: None,
        };
        payments.push(record.clone());
        Ok(record)
    }

    async fn get_payment(&self, payment_id: &str) -> BillingResult<Option<PaymentRecord>> {
        let payments = self.payments.lock().unwrap();
        Ok(payments.iter().find(|p| p.payment_id == payment_id).cloned())
    }

    async fn get_payment_by_order_id(
        &self,
        order_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let payments = self.payments.lock().unwrap();
        Ok(payments.iter().find(|p| p.order_id == order_id).cloned())
    }

    async fn confirm_payment(
        &self,
        order_id: &str,
        paid_at: OffsetDateTime,
        key_uuid: Uuid,
    ) -> BillingResult<PaymentRecord> {
        let mut payments = self.payments.lock().unwrap();
        let record = payments
            .iter_mut()
            .find(|p| p.order_id == order_id)
            .ok_or_else(|| BillingError::not_found(format!("payment {order_id}")))?;
        if record.status != PaymentStatus::Paid {
            record.status = PaymentStatus::Paid;
            record.paid_at = Some(paid_at);
            record.key_uuid = Some(key_uuid);
            record.provider_status = Some("paid".to_string());
        }
        Ok(record.clone())
    }

    async fn record_provider_status(&self, order_id: &str, status: &str) -> BillingResult<()> {
        let mut payments = self.payments.lock().unwrap();
        if let Some(record) = payments
            .iter_mut()
            .find(|p| p.order_id == order_id && p.status != PaymentStatus::Paid)
        {
            record.provider_status = Some(status.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryReferralLedger {
    links: Mutex<HashMap<String, String>>,
    bonuses: Mutex<HashSet<(String, String)>>,
}

#[async_trait]
impl ReferralLedger for MemoryReferralLedger {
    async fn referrer_of(&self, referee: &str) -> BillingResult<Option<String>> {
        Ok(self.links.lock().unwrap().get(referee).cloned())
    }

    async fn record_referral(
        &self,
        referrer: &str,
        referee: &str,
        _chat_id: Option<i64>,
    ) -> BillingResult<bool> {
        let mut links = self.links.lock().unwrap();
        match links.get(referee) {
            None => {
                links.insert(referee.to_string(), referrer.to_string());
                Ok(true)
            }
            Some(existing) if existing == referrer => Ok(false),
            Some(existing) => Err(BillingError::Conflict(format!(
                "referee {referee} already linked to {existing}"
            ))),
        }
    }

    async fn bonus_exists(&self, referrer: &str, referee: &str) -> BillingResult<bool> {
        Ok(self
            .bonuses
            .lock()
            .unwrap()
            .contains(&(referrer.to_string(), referee.to_string())))
    }

    async fn record_bonus(
        &self,
        referrer: &str,
        referee: &str,
        _bonus_days: i64,
    ) -> BillingResult<bool> {
        Ok(self
            .bonuses
            .lock()
            .unwrap()
            .insert((referrer.to_string(), referee.to_string())))
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<RenewalJob>>,
    next_id: AtomicI64,
}

impl MemoryJobStore {
    pub fn jobs(&self) -> Vec<RenewalJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Force every incomplete job due at `now`.
    pub fn make_all_due(&self, now: OffsetDateTime) {
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs.iter_mut().filter(|j| !j.completed) {
            job.next_attempt_at = now;
        }
    }
}

#[async_trait]
impl NotificationJobStore for MemoryJobStore {
    async fn schedule(
        &self,
        key_uuid: Uuid,
        chat_id: Option<i64>,
        username: Option<&str>,
        expires_at: Option<OffsetDateTime>,
        first_attempt_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|j| j.key_uuid == key_uuid && !j.completed) {
            return Ok(false);
        }
        jobs.push(RenewalJob {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            key_uuid,
            chat_id,
            username: username.map(str::to_string),
            expires_at,
            stage: 0,
            completed: false,
            last_sent_at: None,
            next_attempt_at: first_attempt_at,
            last_error: None,
        });
        Ok(true)
    }

    async fn due_jobs(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<RenewalJob>> {
        let mut due: Vec<_> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| !j.completed && j.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_attempt_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn mark_sent(
        &self,
        id: i64,
        new_stage: i16,
        completed: bool,
        sent_at: OffsetDateTime,
        next_attempt_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id && j.stage < new_stage) {
            job.stage = new_stage;
            job.completed = completed;
            job.last_sent_at = Some(sent_at);
            job.next_attempt_at = next_attempt_at;
            job.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.last_error = Some(error.to_string());
            job.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }

    async fn mark_completed(&self, id: i64) -> BillingResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.completed = true;
        }
        Ok(())
    }
}

/// Records outgoing messages; can be switched to fail deliveries or
/// invoice-link creation.
#[derive(Default)]
pub struct RecordingMessenger {
    pub sent: Mutex<Vec<(i64, String)>>,
    pub fail_sends: AtomicBool,
    pub fail_invoices: AtomicBool,
}

impl RecordingMessenger {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_message(&self, chat_id: i64, text: &str) -> BillingResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BillingError::upstream("messenger unavailable"));
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }

    async fn create_invoice_link(
        &self,
        _title: &str,
        _description: &str,
        payload: &str,
        _amount: i64,
    ) -> BillingResult<String> {
        if self.fail_invoices.load(Ordering::SeqCst) {
            return Err(BillingError::upstream("invoice creation unavailable"));
        }
        Ok(format!("https://t.example/invoice/{payload}"))
    }

    async fn answer_pre_checkout(
        &self,
        _query_id: &str,
        _ok: bool,
        _reason: Option<&str>,
    ) -> BillingResult<()> {
        Ok(())
    }
}

/// Records credential mutations; can be switched to fail removals.
#[derive(Default)]
pub struct RecordingCredentialService {
    pub applied: Mutex<Vec<Uuid>>,
    pub removed: Mutex<Vec<Uuid>>,
    pub fail_removals: AtomicBool,
}

#[async_trait]
impl CredentialService for RecordingCredentialService {
    async fn apply_client_set(&self, clients: &[ClientSpec]) -> BillingResult<()> {
        let mut applied = self.applied.lock().unwrap();
        applied.extend(clients.iter().map(|c| c.id));
        Ok(())
    }

    async fn remove_client(&self, id: Uuid) -> BillingResult<()> {
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(BillingError::upstream("proxy unavailable"));
        }
        self.removed.lock().unwrap().push(id);
        Ok(())
    }
}
