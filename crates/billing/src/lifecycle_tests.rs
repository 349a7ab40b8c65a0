//! End-to-end properties of the lifecycle engine, exercised against the
//! in-memory collaborators.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use keygate_shared::{Plan, PlanTable};

use crate::keys::{issue_or_extend, NewKey, SubscriptionKeyStore};
use crate::links::{AccessLinkBuilder, LinkSecurity};
use crate::models::PaymentStatus;
use crate::monitor::ExpiredKeyMonitor;
use crate::error::{BillingError, BillingResult};
use crate::notify::{
    NotificationJobStore, ReminderTextSource, RenewalNotificationScheduler, SchedulerConfig,
    TemplateReminderTexts,
};
use crate::payments::{NewPayment, PaymentLedger};
use crate::referrals::{ReferralBonusEngine, ReferralLedger};
use crate::testutil::*;
use crate::webhooks::{WebhookOutcome, WebhookReconciler};

const SECRET: &str = "test-webhook-secret";

fn plan_table() -> Arc<PlanTable> {
    Arc::new(PlanTable::new(
        vec![
            Plan {
                code: "1m".to_string(),
                title: "1 month".to_string(),
                price: 80,
                duration_days: 30,
                is_subscription: false,
            },
            Plan {
                code: "3m".to_string(),
                title: "3 months".to_string(),
                price: 200,
                duration_days: 90,
                is_subscription: false,
            },
        ],
        7,
    ))
}

fn link_builder() -> AccessLinkBuilder {
    AccessLinkBuilder::new("vpn.test", 443, LinkSecurity::None)
}

struct Harness {
    payments: Arc<MemoryPaymentLedger>,
    keys: Arc<MemoryKeyStore>,
    referrals: Arc<MemoryReferralLedger>,
    messenger: Arc<RecordingMessenger>,
    reconciler: WebhookReconciler,
}

fn harness() -> Harness {
    let payments = Arc::new(MemoryPaymentLedger::default());
    let keys = Arc::new(MemoryKeyStore::default());
    let referrals = Arc::new(MemoryReferralLedger::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let plans = plan_table();

    let engine = ReferralBonusEngine::new(
        referrals.clone(),
        keys.clone(),
        link_builder(),
        plans.referral_bonus_days,
    );
    let reconciler = WebhookReconciler::new(
        SECRET,
        payments.clone(),
        keys.clone(),
        engine,
        plans,
        link_builder(),
        Some(messenger.clone()),
        None,
    );

    Harness {
        payments,
        keys,
        referrals,
        messenger,
        reconciler,
    }
}

fn pending_payment(order_id: &str, username: &str, plan: &str, amount: i64) -> NewPayment {
    NewPayment {
        payment_id: format!("pay-{order_id}"),
        order_id: order_id.to_string(),
        username: username.to_string(),
        chat_id: Some(1001),
        plan_code: plan.to_string(),
        amount,
        currency: "RUB".to_string(),
        provider: Some("cardgw".to_string()),
        provider_payment_id: None,
        payment_url: None,
        source: "api".to_string(),
        referrer: None,
    }
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

async fn deliver(h: &Harness, body: &serde_json::Value) -> WebhookOutcome {
    let raw = serde_json::to_vec(body).unwrap();
    h.reconciler.process(&raw, &sign(&raw)).await.unwrap()
}

#[tokio::test]
async fn paid_webhook_issues_key_and_confirms_payment() {
    let h = harness();
    h.payments
        .create_payment(pending_payment("o1", "alice", "1m", 80))
        .await
        .unwrap();

    let outcome = deliver(&h, &json!({"order_id": "o1", "status": "paid", "amount": 80})).await;

    let WebhookOutcome::Applied { key_uuid, expires_at, .. } = outcome else {
        panic!("expected Applied, got {outcome:?}");
    };

    let key = h.keys.get_active_key("alice").await.unwrap().unwrap();
    assert_eq!(key.uuid, key_uuid);
    assert!(key.active);
    let expected = OffsetDateTime::now_utc() + Duration::days(30);
    assert!((expires_at - expected).abs() < Duration::minutes(1));

    let payment = h.payments.get_payment_by_order_id("o1").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.key_uuid, Some(key_uuid));
    assert_eq!(h.messenger.sent_count(), 1);
}

#[tokio::test]
async fn duplicate_delivery_applies_side_effects_once() {
    let h = harness();
    h.payments
        .create_payment(pending_payment("o1", "alice", "1m", 80))
        .await
        .unwrap();

    let body = json!({"order_id": "o1", "status": "paid", "amount": 80});
    let first = deliver(&h, &body).await;
    let WebhookOutcome::Applied { key_uuid, expires_at, .. } = first else {
        panic!("expected Applied, got {first:?}");
    };

    let second = deliver(&h, &body).await;
    assert_eq!(
        second,
        WebhookOutcome::AlreadyPaid {
            order_id: "o1".to_string(),
            key_uuid: Some(key_uuid),
        }
    );

    // The replay must not move the expiry.
    let key = h.keys.get_active_key("alice").await.unwrap().unwrap();
    assert_eq!(key.expires_at, expires_at);
}

#[tokio::test]
async fn renewal_extends_from_the_later_of_expiry_and_now() {
    let h = harness();
    let existing_expiry = OffsetDateTime::now_utc() + Duration::days(5);
    h.keys
        .create_key(NewKey {
            uuid: Uuid::new_v4(),
            username: "alice".to_string(),
            chat_id: Some(1001),
            link: "vless://existing".to_string(),
            label: "KEYGATE_alice".to_string(),
            expires_at: existing_expiry,
            trial: false,
            is_subscription: false,
        })
        .await
        .unwrap();

    h.payments
        .create_payment(pending_payment("o2", "alice", "1m", 80))
        .await
        .unwrap();
    deliver(&h, &json!({"order_id": "o2", "status": "paid"})).await;

    let key = h.keys.get_active_key("alice").await.unwrap().unwrap();
    let expected = existing_expiry + Duration::days(30);
    assert!((key.expires_at - expected).abs() < Duration::minutes(1));

    // Still exactly one active key for the username.
    assert_eq!(h.keys.list_expired(expected + Duration::days(1)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn expired_key_is_extended_from_now() {
    let h = harness();
    let lapsed = OffsetDateTime::now_utc() - Duration::days(10);
    h.keys
        .create_key(NewKey {
            uuid: Uuid::new_v4(),
            username: "alice".to_string(),
            chat_id: None,
            link: "vless://existing".to_string(),
            label: "KEYGATE_alice".to_string(),
            expires_at: lapsed,
            trial: false,
            is_subscription: false,
        })
        .await
        .unwrap();

    let key = issue_or_extend(h.keys.as_ref(), &link_builder(), "alice", None, 30, false)
        .await
        .unwrap();
    let expected = OffsetDateTime::now_utc() + Duration::days(30);
    assert!((key.expires_at - expected).abs() < Duration::minutes(1));
}

#[tokio::test]
async fn referral_bonus_is_granted_exactly_once() {
    let h = harness();
    h.referrals
        .record_referral("carol", "bob", Some(2002))
        .await
        .unwrap();

    // Carol already has a key expiring in 10 days.
    let carol_expiry = OffsetDateTime::now_utc() + Duration::days(10);
    h.keys
        .create_key(NewKey {
            uuid: Uuid::new_v4(),
            username: "carol".to_string(),
            chat_id: Some(3003),
            link: "vless://carol".to_string(),
            label: "KEYGATE_carol".to_string(),
            expires_at: carol_expiry,
            trial: false,
            is_subscription: false,
        })
        .await
        .unwrap();

    h.payments
        .create_payment(pending_payment("o3", "bob", "1m", 80))
        .await
        .unwrap();

    let body = json!({"order_id": "o3", "status": "paid"});
    deliver(&h, &body).await;
    deliver(&h, &body).await;

    assert!(h.referrals.bonus_exists("carol", "bob").await.unwrap());
    let carol = h.keys.get_active_key("carol").await.unwrap().unwrap();
    let expected = carol_expiry + Duration::days(7);
    assert!(
        (carol.expires_at - expected).abs() < Duration::minutes(1),
        "bonus must extend carol's key exactly once"
    );
}

#[tokio::test]
async fn non_success_status_is_recorded_and_ignored() {
    let h = harness();
    h.payments
        .create_payment(pending_payment("o4", "alice", "1m", 80))
        .await
        .unwrap();

    let outcome = deliver(&h, &json!({"order_id": "o4", "status": "expired"})).await;
    assert_eq!(
        outcome,
        WebhookOutcome::Ignored {
            order_id: "o4".to_string(),
            status: "expired".to_string(),
        }
    );

    let payment = h.payments.get_payment_by_order_id("o4").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.provider_status.as_deref(), Some("expired"));
    assert!(h.keys.get_active_key("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_order_is_reported_without_fabricating_a_payment() {
    let h = harness();
    let outcome = deliver(&h, &json!({"order_id": "ghost", "status": "paid"})).await;
    assert_eq!(
        outcome,
        WebhookOutcome::UnknownPayment {
            order_id: "ghost".to_string(),
        }
    );
    assert!(h.payments.get_payment_by_order_id("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn bad_signature_is_rejected_before_any_processing() {
    let h = harness();
    h.payments
        .create_payment(pending_payment("o5", "alice", "1m", 80))
        .await
        .unwrap();

    let raw = serde_json::to_vec(&json!({"order_id": "o5", "status": "paid"})).unwrap();
    let err = h.reconciler.process(&raw, "deadbeef").await.unwrap_err();
    assert!(matches!(err, crate::BillingError::Signature));

    let payment = h.payments.get_payment_by_order_id("o5").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_webhook() {
    let h = harness();
    h.messenger.fail_sends.store(true, Ordering::SeqCst);
    h.payments
        .create_payment(pending_payment("o6", "alice", "1m", 80))
        .await
        .unwrap();

    let outcome = deliver(&h, &json!({"order_id": "o6", "status": "paid"})).await;
    assert!(matches!(outcome, WebhookOutcome::Applied { .. }));

    let payment = h.payments.get_payment_by_order_id("o6").await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
}

#[tokio::test]
async fn expiry_sweep_deactivates_once_and_is_idempotent() {
    let keys = Arc::new(MemoryKeyStore::default());
    let credentials = Arc::new(RecordingCredentialService::default());
    let jobs = Arc::new(MemoryJobStore::default());
    let monitor = ExpiredKeyMonitor::new(keys.clone(), credentials.clone(), jobs.clone());

    let now = OffsetDateTime::now_utc();
    let expired_uuid = Uuid::new_v4();
    keys.create_key(NewKey {
        uuid: expired_uuid,
        username: "alice".to_string(),
        chat_id: Some(1001),
        link: "vless://alice".to_string(),
        label: "KEYGATE_alice".to_string(),
        expires_at: now - Duration::days(1),
        trial: false,
        is_subscription: false,
    })
    .await
    .unwrap();
    keys.create_key(NewKey {
        uuid: Uuid::new_v4(),
        username: "bob".to_string(),
        chat_id: None,
        link: "vless://bob".to_string(),
        label: "KEYGATE_bob".to_string(),
        expires_at: now + Duration::days(30),
        trial: false,
        is_subscription: false,
    })
    .await
    .unwrap();

    assert_eq!(monitor.run_once(now).await.unwrap(), 1);
    assert_eq!(credentials.removed.lock().unwrap().as_slice(), &[expired_uuid]);
    assert_eq!(jobs.jobs().len(), 1);

    // No new expirations: the second sweep is a no-op.
    assert_eq!(monitor.run_once(now).await.unwrap(), 0);
    assert_eq!(jobs.jobs().len(), 1);
}

#[tokio::test]
async fn credential_removal_failure_does_not_reactivate_the_key() {
    let keys = Arc::new(MemoryKeyStore::default());
    let credentials = Arc::new(RecordingCredentialService::default());
    credentials.fail_removals.store(true, Ordering::SeqCst);
    let jobs = Arc::new(MemoryJobStore::default());
    let monitor = ExpiredKeyMonitor::new(keys.clone(), credentials, jobs);

    let now = OffsetDateTime::now_utc();
    keys.create_key(NewKey {
        uuid: Uuid::new_v4(),
        username: "alice".to_string(),
        chat_id: Some(1001),
        link: "vless://alice".to_string(),
        label: "KEYGATE_alice".to_string(),
        expires_at: now - Duration::hours(1),
        trial: false,
        is_subscription: false,
    })
    .await
    .unwrap();

    assert_eq!(monitor.run_once(now).await.unwrap(), 1);
    assert!(keys.get_active_key("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn scheduling_a_chain_twice_keeps_one_in_flight() {
    let jobs = MemoryJobStore::default();
    let now = OffsetDateTime::now_utc();
    let key_uuid = Uuid::new_v4();

    assert!(jobs.schedule(key_uuid, Some(1), Some("alice"), None, now).await.unwrap());
    assert!(!jobs.schedule(key_uuid, Some(1), Some("alice"), None, now).await.unwrap());
    assert_eq!(jobs.jobs().len(), 1);
}

#[tokio::test]
async fn reminder_chain_advances_through_three_stages() {
    let jobs = Arc::new(MemoryJobStore::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let scheduler = RenewalNotificationScheduler::new(
        jobs.clone(),
        messenger.clone(),
        Arc::new(TemplateReminderTexts),
        SchedulerConfig::default(),
    );

    let now = OffsetDateTime::now_utc();
    jobs.schedule(Uuid::new_v4(), Some(1001), Some("alice"), None, now)
        .await
        .unwrap();

    for expected_stage in 1..=3i16 {
        jobs.make_all_due(now);
        assert_eq!(scheduler.run_once(now).await.unwrap(), 1);
        let job = &jobs.jobs()[0];
        assert_eq!(job.stage, expected_stage);
        assert_eq!(job.completed, expected_stage == 3);
    }

    assert_eq!(messenger.sent_count(), 3);

    // Completed chains are left alone.
    jobs.make_all_due(now);
    assert_eq!(scheduler.run_once(now).await.unwrap(), 0);
}

#[tokio::test]
async fn delivery_failure_retries_the_same_stage() {
    let jobs = Arc::new(MemoryJobStore::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let scheduler = RenewalNotificationScheduler::new(
        jobs.clone(),
        messenger.clone(),
        Arc::new(TemplateReminderTexts),
        SchedulerConfig::default(),
    );

    let now = OffsetDateTime::now_utc();
    jobs.schedule(Uuid::new_v4(), Some(1001), Some("alice"), None, now)
        .await
        .unwrap();

    messenger.fail_sends.store(true, Ordering::SeqCst);
    assert_eq!(scheduler.run_once(now).await.unwrap(), 0);

    let job = &jobs.jobs()[0];
    assert_eq!(job.stage, 0, "failed delivery must not advance the stage");
    assert!(job.last_error.is_some());
    assert!(job.next_attempt_at > now);

    // The retry succeeds and resumes the chain where it left off.
    messenger.fail_sends.store(false, Ordering::SeqCst);
    jobs.make_all_due(now);
    assert_eq!(scheduler.run_once(now).await.unwrap(), 1);
    assert_eq!(jobs.jobs()[0].stage, 1);
}

struct FailingTexts;

#[async_trait::async_trait]
impl ReminderTextSource for FailingTexts {
    async fn reminder_text(&self, _stage: i16, _username: Option<&str>) -> BillingResult<String> {
        Err(BillingError::upstream("copywriter offline"))
    }
}

struct EmptyTexts;

#[async_trait::async_trait]
impl ReminderTextSource for EmptyTexts {
    async fn reminder_text(&self, _stage: i16, _username: Option<&str>) -> BillingResult<String> {
        Ok(String::new())
    }
}

#[tokio::test]
async fn text_generation_failure_retries_the_same_stage() {
    let jobs = Arc::new(MemoryJobStore::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let config = SchedulerConfig::default();
    let scheduler = RenewalNotificationScheduler::new(
        jobs.clone(),
        messenger.clone(),
        Arc::new(FailingTexts),
        config.clone(),
    );

    let now = OffsetDateTime::now_utc();
    jobs.schedule(Uuid::new_v4(), Some(1001), Some("alice"), None, now)
        .await
        .unwrap();

    assert_eq!(scheduler.run_once(now).await.unwrap(), 0);

    let job = &jobs.jobs()[0];
    assert_eq!(job.stage, 0, "generation failure must not advance the stage");
    assert!(!job.completed);
    assert!(job.last_error.is_some());
    assert_eq!(job.next_attempt_at, now + config.retry_interval);
    assert_eq!(messenger.sent_count(), 0, "nothing must be delivered");
}

#[tokio::test]
async fn empty_reminder_text_counts_as_generation_failure() {
    let jobs = Arc::new(MemoryJobStore::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let config = SchedulerConfig::default();
    let scheduler = RenewalNotificationScheduler::new(
        jobs.clone(),
        messenger.clone(),
        Arc::new(EmptyTexts),
        config.clone(),
    );

    let now = OffsetDateTime::now_utc();
    jobs.schedule(Uuid::new_v4(), Some(1001), Some("alice"), None, now)
        .await
        .unwrap();

    assert_eq!(scheduler.run_once(now).await.unwrap(), 0);

    let job = &jobs.jobs()[0];
    assert_eq!(job.stage, 0);
    assert_eq!(job.next_attempt_at, now + config.retry_interval);
    assert!(job.last_error.is_some());
    assert_eq!(messenger.sent_count(), 0);
}

#[tokio::test]
async fn chain_without_chat_id_completes_undelivered() {
    let jobs = Arc::new(MemoryJobStore::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let scheduler = RenewalNotificationScheduler::new(
        jobs.clone(),
        messenger.clone(),
        Arc::new(TemplateReminderTexts),
        SchedulerConfig::default(),
    );

    let now = OffsetDateTime::now_utc();
    jobs.schedule(Uuid::new_v4(), None, Some("alice"), None, now)
        .await
        .unwrap();

    assert_eq!(scheduler.run_once(now).await.unwrap(), 0);
    assert!(jobs.jobs()[0].completed);
    assert_eq!(messenger.sent_count(), 0);
}

#[tokio::test]
async fn different_referrer_for_same_referee_is_a_conflict() {
    let referrals = MemoryReferralLedger::default();
    referrals.record_referral("carol", "bob", None).await.unwrap();
    assert!(!referrals.record_referral("carol", "bob", None).await.unwrap());
    assert!(referrals.record_referral("mallory", "bob", None).await.is_err());
}
