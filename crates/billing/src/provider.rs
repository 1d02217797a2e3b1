//! Provider-agnostic payment abstraction
//!
//! Stripe and PayPal are modeled behind one `PaymentProvider` interface so the
//! entitlement reconciliation logic is written once. Each adapter normalizes
//! its webhook payloads into [`ProviderEvent`] values; everything downstream
//! of verification is provider-blind.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Which payment provider an event or checkout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    Paypal,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::Paypal => "paypal",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a checkout buys a subscription or a one-time token pack.
///
/// Dispatch between the two is a string tag in checkout metadata, never the
/// provider event type alone: a token purchase must not fall into the
/// subscription reconciliation branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutKind {
    Subscription,
    Token,
}

/// Opaque metadata carried through the provider and returned on its webhooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutMetadata {
    pub kind: CheckoutKind,
    /// `plans.id` for subscriptions, `token_plans.id` for token packs.
    pub plan_id: Uuid,
    pub email: String,
    /// Yearly billing interval; meaningless for token packs.
    #[serde(default)]
    pub yearly: bool,
}

impl CheckoutMetadata {
    /// Flatten into the string map Stripe metadata requires.
    pub fn to_map(&self) -> HashMap<String, String> {
        let kind = match self.kind {
            CheckoutKind::Subscription => "subscription",
            CheckoutKind::Token => "token",
        };
        HashMap::from([
            ("kind".to_string(), kind.to_string()),
            ("plan_id".to_string(), self.plan_id.to_string()),
            ("email".to_string(), self.email.to_string()),
            ("yearly".to_string(), self.yearly.to_string()),
        ])
    }

    pub fn from_map(map: &HashMap<String, String>) -> BillingResult<CheckoutMetadata> {
        let kind = match map.get("kind").map(String::as_str) {
            Some("subscription") => CheckoutKind::Subscription,
            Some("token") => CheckoutKind::Token,
            other => {
                return Err(BillingError::InvalidMetadata(format!(
                    "missing or unknown kind tag: {other:?}"
                )))
            }
        };
        let plan_id = map
            .get("plan_id")
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| BillingError::InvalidMetadata("bad plan_id".to_string()))?;
        let email = map
            .get("email")
            .filter(|e| !e.is_empty())
            .cloned()
            .ok_or_else(|| BillingError::InvalidMetadata("missing email".to_string()))?;
        let yearly = map.get("yearly").map(|s| s == "true").unwrap_or(false);

        Ok(CheckoutMetadata {
            kind,
            plan_id,
            email,
            yearly,
        })
    }

    /// PayPal carries metadata as a single `custom_id` string; we encode it
    /// as JSON there.
    pub fn to_custom_id(&self) -> BillingResult<String> {
        serde_json::to_string(self)
            .map_err(|e| BillingError::InvalidMetadata(format!("encode custom_id: {e}")))
    }

    pub fn from_custom_id(raw: &str) -> BillingResult<CheckoutMetadata> {
        serde_json::from_str(raw)
            .map_err(|e| BillingError::InvalidMetadata(format!("decode custom_id: {e}")))
    }
}

/// A normalized billing event, ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Checkout completed / subscription activated. Applies a wholesale
    /// snapshot of the plan onto the user's subscription record.
    SubscriptionActivated {
        email: String,
        plan_id: Uuid,
        subscription_id: String,
        /// Stripe customer id; None for PayPal.
        customer_ref: Option<String>,
        /// PayPal payer id; None for Stripe.
        payer_ref: Option<String>,
        /// Current period end when the provider supplies one.
        period_end: Option<OffsetDateTime>,
        is_yearly: bool,
    },
    /// Provider-side state change on an existing subscription, located by
    /// reverse lookup on the stored provider subscription id.
    SubscriptionUpdated {
        subscription_id: String,
        cancel_at_period_end: bool,
        past_due: bool,
        period_end: Option<OffsetDateTime>,
    },
    /// Subscription fully deleted at the provider; quotas reset to free-tier
    /// defaults regardless of the prior plan.
    SubscriptionCancelled { subscription_id: String },
    /// One-time token pack purchase; additive credit to the token wallet.
    TokenPackPurchased { email: String, token_plan_id: Uuid },
    /// Authentic event we deliberately do not handle.
    Ignored { event_type: String },
}

/// A webhook event that passed authenticity verification.
#[derive(Debug, Clone)]
pub struct VerifiedEvent {
    pub provider: ProviderKind,
    pub event_id: String,
    pub event_type: String,
    pub event: ProviderEvent,
}

/// What the API layer asks a provider to sell.
#[derive(Debug, Clone)]
pub enum CheckoutRequest {
    Subscription {
        plan: valora_shared::Plan,
        email: String,
        yearly: bool,
    },
    TokenPack {
        token_plan: valora_shared::TokenPlan,
        email: String,
    },
}

/// Provider-hosted checkout the client is redirected to.
#[derive(Debug, Clone, Serialize)]
pub struct HostedCheckout {
    /// Stripe session id or PayPal order/subscription id.
    pub session_id: String,
    /// Approval/redirect URL when the provider returns one.
    pub url: Option<String>,
}

/// Raw webhook transmission headers, provider-specific.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    /// `stripe-signature`
    pub stripe_signature: Option<String>,
    /// `paypal-transmission-id`
    pub paypal_transmission_id: Option<String>,
    /// `paypal-transmission-time`
    pub paypal_transmission_time: Option<String>,
    /// `paypal-transmission-sig`
    pub paypal_transmission_sig: Option<String>,
    /// `paypal-cert-url`
    pub paypal_cert_url: Option<String>,
    /// `paypal-auth-algo`
    pub paypal_auth_algo: Option<String>,
}

/// One payment provider: checkout creation, webhook verification, cancellation.
pub trait PaymentProvider {
    fn kind(&self) -> ProviderKind;

    fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> impl std::future::Future<Output = BillingResult<HostedCheckout>> + Send;

    /// Verify authenticity and normalize the payload. A verification failure
    /// must abort with `WebhookSignatureInvalid` before any mutation.
    fn verify_webhook(
        &self,
        payload: &str,
        headers: &WebhookHeaders,
    ) -> impl std::future::Future<Output = BillingResult<VerifiedEvent>> + Send;

    /// Request cancellation at period end for a provider subscription id.
    fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> impl std::future::Future<Output = BillingResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(kind: CheckoutKind) -> CheckoutMetadata {
        CheckoutMetadata {
            kind,
            plan_id: Uuid::new_v4(),
            email: "buyer@example.com".to_string(),
            yearly: true,
        }
    }

    #[test]
    fn metadata_map_round_trip() {
        let meta = metadata(CheckoutKind::Subscription);
        let parsed = CheckoutMetadata::from_map(&meta.to_map()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn metadata_custom_id_round_trip() {
        let meta = metadata(CheckoutKind::Token);
        let parsed = CheckoutMetadata::from_custom_id(&meta.to_custom_id().unwrap()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn metadata_rejects_missing_kind_tag() {
        let mut map = metadata(CheckoutKind::Token).to_map();
        map.remove("kind");
        assert!(matches!(
            CheckoutMetadata::from_map(&map),
            Err(BillingError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn metadata_rejects_unknown_kind_tag() {
        let mut map = metadata(CheckoutKind::Token).to_map();
        map.insert("kind".to_string(), "gift".to_string());
        assert!(CheckoutMetadata::from_map(&map).is_err());
    }

    #[test]
    fn metadata_rejects_empty_email() {
        let mut map = metadata(CheckoutKind::Subscription).to_map();
        map.insert("email".to_string(), String::new());
        assert!(CheckoutMetadata::from_map(&map).is_err());
    }
}
