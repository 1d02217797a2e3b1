// Billing crate clippy configuration
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Valora Billing Module
//!
//! Payment provider integration and subscription reconciliation.
//!
//! ## Features
//!
//! - **Checkout**: Hosted checkout sessions for plan subscriptions and token
//!   packs, on Stripe or PayPal
//! - **Webhooks**: Signature verification, idempotent processing, and
//!   normalization of both providers' events into one internal shape
//! - **Reconciliation**: Transactional entitlement updates driven by
//!   normalized events (activation, status sync, cancellation, token credit)
//! - **Invariants**: Runnable consistency checks over the entitlement store
//! - **Audit**: Append-only billing event log

pub mod error;
pub mod events;
pub mod invariants;
pub mod paypal;
pub mod provider;
pub mod reconcile;
pub mod stripe;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

pub use error::{BillingError, BillingResult};
pub use events::{BillingEventLogger, BillingEventType, NewBillingEvent};
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation};
pub use paypal::{PayPalConfig, PayPalGateway};
pub use provider::{
    CheckoutKind, CheckoutMetadata, CheckoutRequest, HostedCheckout, PaymentProvider,
    ProviderEvent, ProviderKind, VerifiedEvent, WebhookHeaders,
};
pub use reconcile::EntitlementService;
pub use stripe::{StripeConfig, StripeGateway};
pub use webhooks::WebhookProcessor;

use sqlx::PgPool;

/// Facade wiring the configured payment gateways to the webhook processor.
///
/// Either gateway may be absent; a request naming an unconfigured provider
/// gets [`BillingError::Config`].
pub struct BillingService {
    pub stripe: Option<StripeGateway>,
    pub paypal: Option<PayPalGateway>,
    pub webhooks: WebhookProcessor,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Build from environment variables.
    ///
    /// A provider whose credentials are missing is skipped with a warning
    /// rather than failing startup, so single-provider deployments work
    /// without dummy config.
    pub fn from_env(pool: PgPool, http: reqwest::Client) -> Self {
        let stripe = match StripeConfig::from_env() {
            Ok(config) => Some(StripeGateway::new(config)),
            Err(err) => {
                tracing::warn!("Stripe gateway disabled: {err}");
                None
            }
        };
        let paypal = match PayPalConfig::from_env() {
            Ok(config) => Some(PayPalGateway::new(http, config)),
            Err(err) => {
                tracing::warn!("PayPal gateway disabled: {err}");
                None
            }
        };
        Self {
            stripe,
            paypal,
            webhooks: WebhookProcessor::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }

    /// Create a hosted checkout with the named provider.
    pub async fn create_checkout(
        &self,
        provider: ProviderKind,
        request: CheckoutRequest,
    ) -> BillingResult<HostedCheckout> {
        match provider {
            ProviderKind::Stripe => self.require_stripe()?.create_checkout(&request).await,
            ProviderKind::Paypal => self.require_paypal()?.create_checkout(&request).await,
        }
    }

    /// Verify a webhook payload. Kept separate from processing so the HTTP
    /// layer can map verification failure to 400 while a reconciliation
    /// failure after verification still acknowledges the provider.
    pub async fn verify_webhook(
        &self,
        provider: ProviderKind,
        payload: &str,
        headers: &WebhookHeaders,
    ) -> BillingResult<VerifiedEvent> {
        match provider {
            ProviderKind::Stripe => self.require_stripe()?.verify_webhook(payload, headers).await,
            ProviderKind::Paypal => self.require_paypal()?.verify_webhook(payload, headers).await,
        }
    }

    /// Ask the provider to cancel at period end.
    pub async fn cancel_subscription(
        &self,
        provider: ProviderKind,
        provider_subscription_id: &str,
    ) -> BillingResult<()> {
        match provider {
            ProviderKind::Stripe => {
                self.require_stripe()?
                    .cancel_subscription(provider_subscription_id)
                    .await
            }
            ProviderKind::Paypal => {
                self.require_paypal()?
                    .cancel_subscription(provider_subscription_id)
                    .await
            }
        }
    }

    fn require_stripe(&self) -> BillingResult<&StripeGateway> {
        self.stripe
            .as_ref()
            .ok_or_else(|| BillingError::Config("Stripe is not configured".to_string()))
    }

    fn require_paypal(&self) -> BillingResult<&PayPalGateway> {
        self.paypal
            .as_ref()
            .ok_or_else(|| BillingError::Config("PayPal is not configured".to_string()))
    }
}
