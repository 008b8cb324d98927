pub mod billing;
pub mod common;
pub mod entitlements;
pub mod fastbill_webhooks;
pub mod paylane_gateway;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::accounts::{AccountResolver, HttpAccountResolver};
use crate::services::entitlement::EntitlementService;
use crate::services::ledger::TransactionLedger;
use crate::services::sweep::ReconciliationSweep;
use crate::services::token_provider::TokenProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub ledger: Arc<TransactionLedger>,
    pub entitlements: Arc<EntitlementService>,
    pub sweep: Arc<ReconciliationSweep>,
    pub accounts: Arc<dyn AccountResolver>,
}

impl AppServices {
    /// Build the service container with the HTTP-backed account resolver.
    pub fn new(db_pool: Arc<DbPool>, config: Arc<AppConfig>, event_sender: Arc<EventSender>) -> Self {
        let tokens = Arc::new(TokenProvider::new(
            config
                .accounts_token_url
                .clone()
                .unwrap_or_else(|| "http://localhost:9000/oauth/token".to_string()),
            config.accounts_client_id.clone().unwrap_or_default(),
            config.accounts_client_secret.clone().unwrap_or_default(),
            Duration::from_secs(config.outbound_timeout_secs),
            config.token_refresh_margin_secs,
        ));

        if config.accounts_api_url.is_none() {
            warn!("accounts_api_url not configured; account resolution will fail until it is set");
        }

        let accounts: Arc<dyn AccountResolver> = Arc::new(HttpAccountResolver::new(
            config
                .accounts_api_url
                .clone()
                .unwrap_or_else(|| "http://localhost:9000".to_string()),
            tokens,
            Duration::from_secs(config.outbound_timeout_secs),
        ));

        Self::with_resolver(db_pool, config, event_sender, accounts)
    }

    /// Build the container with an explicit resolver (tests inject mocks here).
    pub fn with_resolver(
        db_pool: Arc<DbPool>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
        accounts: Arc<dyn AccountResolver>,
    ) -> Self {
        let ledger = Arc::new(TransactionLedger::new(db_pool.clone(), event_sender.clone()));
        let entitlements = Arc::new(EntitlementService::new(
            db_pool.clone(),
            ledger.clone(),
            config.clone(),
            event_sender.clone(),
        ));
        let sweep = Arc::new(ReconciliationSweep::new(
            db_pool,
            ledger.clone(),
            entitlements.clone(),
            config,
            event_sender,
        ));

        Self {
            ledger,
            entitlements,
            sweep,
            accounts,
        }
    }
}
