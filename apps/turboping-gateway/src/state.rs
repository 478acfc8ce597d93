use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use turboping_core::db::Ledger;
use turboping_core::{
    CommissionCalculator, CredentialService, CredentialVault, Dispatcher, EngineError,
    LifecycleEvent, Lifecycle, PaymentIntents, PayoutService, Reconciler, UserService,
};

use crate::config::GatewayConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub ledger: Arc<dyn Ledger>,
    pub reconciler: Reconciler,
    pub lifecycle: Lifecycle,
    pub payouts: PayoutService,
    pub intents: PaymentIntents,
    pub users: UserService,
    pub credentials: CredentialService,
    pub commission: CommissionCalculator,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        ledger: Arc<dyn Ledger>,
        vault: Arc<dyn CredentialVault>,
        dispatcher: Dispatcher,
    ) -> Self {
        let engine = Arc::new(config.engine.clone());
        let credentials =
            CredentialService::new(ledger.clone(), vault, config.proxy_servers.clone());

        Self {
            reconciler: Reconciler::new(ledger.clone(), engine.clone()),
            lifecycle: Lifecycle::new(ledger.clone(), engine.clone()),
            payouts: PayoutService::new(ledger.clone(), engine.clone()),
            intents: PaymentIntents::new(ledger.clone(), engine.clone()),
            commission: CommissionCalculator::new(ledger.clone(), engine),
            users: UserService::new(ledger.clone()),
            credentials,
            dispatcher,
            ledger,
            config: Arc::new(config),
        }
    }

    /// Makes sure a user with fresh access holds a credential for their
    /// region, then hands the events to the sinks. Neither step can undo the
    /// committed ledger change, so failures are only logged.
    pub async fn grant_access(&self, user_id: i64, events: &[LifecycleEvent], now: DateTime<Utc>) {
        match self.ledger.user(user_id).await {
            Ok(Some(user)) => match self.credentials.issue(user_id, &user.region, now).await {
                Ok(_) => {}
                Err(EngineError::UnknownRegion(region)) => {
                    warn!("No proxy server for region {}; user {} has no credential", region, user_id);
                }
                Err(e) => warn!("Failed to issue credential for user {}: {}", user_id, e),
            },
            Ok(None) => warn!("User {} vanished before credential issue", user_id),
            Err(e) => warn!("Failed to load user {}: {}", user_id, e),
        }

        self.dispatcher.dispatch(events).await;
    }
}
