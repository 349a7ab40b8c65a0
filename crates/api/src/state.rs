//! Application state shared by all handlers.

use std::sync::Arc;

use sqlx::PgPool;

use keygate_billing::capabilities::{CredentialService, Messenger};
use keygate_billing::proxy::ProxyAdminClient;
use keygate_billing::gateway::{GatewayConfig, PaymentGatewayClient};
use keygate_billing::keys::{PgSubscriptionKeyStore, SubscriptionKeyStore};
use keygate_billing::links::AccessLinkBuilder;
use keygate_billing::payments::{PaymentLedger, PgPaymentLedger};
use keygate_billing::referrals::{PgReferralLedger, ReferralBonusEngine, ReferralLedger};
use keygate_billing::telegram::TelegramMessenger;
use keygate_billing::WebhookReconciler;
use keygate_shared::PlanTable;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub plans: Arc<PlanTable>,
    pub links: AccessLinkBuilder,
    pub payments: Arc<dyn PaymentLedger>,
    pub keys: Arc<dyn SubscriptionKeyStore>,
    pub referrals: Arc<dyn ReferralLedger>,
    pub reconciler: WebhookReconciler,
    pub gateway: Option<PaymentGatewayClient>,
    pub messenger: Option<Arc<dyn Messenger>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let plans = Arc::new(PlanTable::from_env());
        let links = AccessLinkBuilder::from_env();

        let payments: Arc<dyn PaymentLedger> = Arc::new(PgPaymentLedger::new(pool.clone()));
        let keys: Arc<dyn SubscriptionKeyStore> =
            Arc::new(PgSubscriptionKeyStore::new(pool.clone()));
        let referrals: Arc<dyn ReferralLedger> = Arc::new(PgReferralLedger::new(pool.clone()));

        let messenger: Option<Arc<dyn Messenger>> = match &config.bot_token {
            Some(token) => Some(Arc::new(TelegramMessenger::new(token)?)),
            None => {
                tracing::warn!("BOT_TOKEN not set - user notifications disabled");
                None
            }
        };

        let gateway = match GatewayConfig::from_env() {
            Ok(gateway_config) => Some(PaymentGatewayClient::new(gateway_config)?),
            Err(err) => {
                tracing::warn!(error = %err, "Card gateway not configured - hosted invoices disabled");
                None
            }
        };

        let credentials: Option<Arc<dyn CredentialService>> = match std::env::var(
            "PROXY_ADMIN_URL",
        ) {
            Ok(url) if !url.is_empty() => {
                let token = std::env::var("PROXY_ADMIN_TOKEN").unwrap_or_default();
                Some(Arc::new(ProxyAdminClient::new(&url, &token)?))
            }
            _ => {
                tracing::warn!("PROXY_ADMIN_URL not set - proxy credential sync disabled");
                None
            }
        };

        let bonus_engine = ReferralBonusEngine::new(
            referrals.clone(),
            keys.clone(),
            links.clone(),
            plans.referral_bonus_days,
        );
        let reconciler = WebhookReconciler::new(
            config.webhook_secret.clone(),
            payments.clone(),
            keys.clone(),
            bonus_engine,
            plans.clone(),
            links.clone(),
            messenger.clone(),
            credentials,
        );

        Ok(Self {
            pool,
            config,
            plans,
            links,
            payments,
            keys,
            referrals,
            reconciler,
            gateway,
            messenger,
        })
    }
}
