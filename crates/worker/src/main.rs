//! Keygate background worker.
//!
//! Runs the two time-driven loops: the expired key sweep and the renewal
//! reminder scheduler. Each sweep is individually time-bounded so a stuck
//! external call never blocks the next tick.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keygate_billing::capabilities::{CredentialService, Messenger};
use keygate_billing::keys::PgSubscriptionKeyStore;
use keygate_billing::monitor::ExpiredKeyMonitor;
use keygate_billing::notify::{
    PgNotificationJobStore, RenewalNotificationScheduler, SchedulerConfig, TemplateReminderTexts,
};
use keygate_billing::proxy::ProxyAdminClient;
use keygate_billing::telegram::TelegramMessenger;
use keygate_shared::{create_pool, run_migrations};

const DEFAULT_EXPIRY_SWEEP_SECS: u64 = 60;
const DEFAULT_REMINDER_SWEEP_SECS: u64 = 300;

/// Upper bound on one sweep; longer than any sane batch, shorter than the
/// point where overlapping sweeps would pile up.
const SWEEP_TIMEOUT_SECS: u64 = 120;

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keygate_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keygate worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let keys = Arc::new(PgSubscriptionKeyStore::new(pool.clone()));
    let jobs = Arc::new(PgNotificationJobStore::new(pool.clone()));

    let bot_token = std::env::var("BOT_TOKEN")
        .map_err(|_| anyhow::anyhow!("BOT_TOKEN must be set for the worker"))?;
    let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(&bot_token)?);

    let proxy_url = std::env::var("PROXY_ADMIN_URL")
        .map_err(|_| anyhow::anyhow!("PROXY_ADMIN_URL must be set"))?;
    let proxy_token = std::env::var("PROXY_ADMIN_TOKEN").unwrap_or_default();
    let credentials: Arc<dyn CredentialService> =
        Arc::new(ProxyAdminClient::new(&proxy_url, &proxy_token)?);

    let monitor = ExpiredKeyMonitor::new(keys, credentials, jobs.clone());
    let scheduler = RenewalNotificationScheduler::new(
        jobs,
        messenger,
        Arc::new(TemplateReminderTexts),
        SchedulerConfig::default(),
    );

    let expiry_interval = env_secs("EXPIRY_SWEEP_INTERVAL_SECS", DEFAULT_EXPIRY_SWEEP_SECS);
    let reminder_interval = env_secs("REMINDER_SWEEP_INTERVAL_SECS", DEFAULT_REMINDER_SWEEP_SECS);

    let expiry_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(expiry_interval));
        loop {
            ticker.tick().await;
            let sweep = monitor.run_once(OffsetDateTime::now_utc());
            match tokio::time::timeout(Duration::from_secs(SWEEP_TIMEOUT_SECS), sweep).await {
                Ok(Ok(0)) => {}
                Ok(Ok(count)) => tracing::info!(deactivated = count, "Expiry sweep done"),
                Ok(Err(err)) => tracing::error!(error = %err, "Expiry sweep failed"),
                Err(_) => tracing::error!("Expiry sweep timed out"),
            }
        }
    });

    let reminder_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(reminder_interval));
        loop {
            ticker.tick().await;
            let sweep = scheduler.run_once(OffsetDateTime::now_utc());
            match tokio::time::timeout(Duration::from_secs(SWEEP_TIMEOUT_SECS), sweep).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::error!(error = %err, "Reminder sweep failed"),
                Err(_) => tracing::error!("Reminder sweep timed out"),
            }
        }
    });

    tracing::info!(
        expiry_interval_secs = expiry_interval,
        reminder_interval_secs = reminder_interval,
        "Background loops started"
    );

    let _ = tokio::try_join!(expiry_task, reminder_task)?;
    Ok(())
}
