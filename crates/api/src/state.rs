//! Application state

use std::sync::Arc;

use reqwest::Client;
use sqlx::PgPool;
use valora_billing::BillingService;

use crate::{auth::JwtManager, chat::ChatState, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
    pub http_client: Client,
    /// WebSocket rooms for the support chat relay
    pub chat: ChatState,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        // HTTP client shared by the PayPal gateway and any outbound call
        let http_client = Client::new();

        let billing = Arc::new(BillingService::from_env(pool.clone(), http_client.clone()));
        match (&billing.stripe, &billing.paypal) {
            (Some(_), Some(_)) => tracing::info!("Billing initialized with Stripe and PayPal"),
            (Some(_), None) => tracing::info!("Billing initialized with Stripe only"),
            (None, Some(_)) => tracing::info!("Billing initialized with PayPal only"),
            (None, None) => tracing::warn!("No payment provider configured"),
        }

        let chat = ChatState::new();
        tracing::info!("Chat relay state initialized");

        Self {
            pool,
            config,
            jwt_manager,
            billing,
            http_client,
            chat,
        }
    }
}
