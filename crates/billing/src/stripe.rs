//! Stripe adapter
//!
//! Checkout sessions are created with inline `price_data` (plans live in our
//! database, not as pre-provisioned Stripe prices). Webhook verification uses
//! `stripe::Webhook::construct_event` with a manual HMAC fallback for newer
//! Stripe API versions the vendored parser rejects.

use std::collections::HashMap;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use ::stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval, Currency, Event, EventObject,
    EventType, Subscription, SubscriptionId, SubscriptionStatus, UpdateSubscription, Webhook,
};

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutKind, CheckoutMetadata, CheckoutRequest, HostedCheckout, PaymentProvider,
    ProviderEvent, ProviderKind, VerifiedEvent, WebhookHeaders,
};

type HmacSha256 = Hmac<Sha256>;

/// Acceptable clock skew between us and Stripe when verifying manually.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<StripeConfig> {
        let get = |key: &str| {
            std::env::var(key).map_err(|_| BillingError::Config(format!("{key} not set")))
        };
        Ok(StripeConfig {
            secret_key: get("STRIPE_SECRET_KEY")?,
            webhook_secret: get("STRIPE_WEBHOOK_SECRET")?,
            success_url: get("CHECKOUT_SUCCESS_URL")?,
            cancel_url: get("CHECKOUT_CANCEL_URL")?,
        })
    }
}

/// Stripe payment adapter.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Verify and parse a webhook payload.
    ///
    /// Tries the library parser first, then falls back to manual signature
    /// verification (`t=timestamp,v1=signature` header format) so payloads
    /// from newer Stripe API versions still verify.
    fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.config.webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp,
                now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{timestamp}.{payload}");

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Normalize a verified Stripe event.
    fn normalize(&self, event: Event) -> BillingResult<VerifiedEvent> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        let normalized = match event.type_ {
            EventType::CheckoutSessionCompleted => {
                let session = match event.data.object {
                    EventObject::CheckoutSession(s) => s,
                    other => {
                        return Err(BillingError::InvalidMetadata(format!(
                            "checkout.session.completed carried {other:?}"
                        )))
                    }
                };
                let metadata =
                    CheckoutMetadata::from_map(&session.metadata.clone().unwrap_or_default())?;

                match metadata.kind {
                    CheckoutKind::Token => ProviderEvent::TokenPackPurchased {
                        email: metadata.email,
                        token_plan_id: metadata.plan_id,
                    },
                    CheckoutKind::Subscription => {
                        let subscription_id = session
                            .subscription
                            .as_ref()
                            .map(|s| s.id().to_string())
                            .ok_or_else(|| {
                                BillingError::InvalidMetadata(
                                    "completed subscription checkout without subscription"
                                        .to_string(),
                                )
                            })?;
                        let customer_ref = session.customer.as_ref().map(|c| c.id().to_string());

                        ProviderEvent::SubscriptionActivated {
                            email: metadata.email,
                            plan_id: metadata.plan_id,
                            subscription_id,
                            customer_ref,
                            payer_ref: None,
                            // Not carried on the checkout session; the
                            // reconciler derives it from the billing interval.
                            period_end: None,
                            is_yearly: metadata.yearly,
                        }
                    }
                }
            }
            EventType::CustomerSubscriptionUpdated => {
                let sub = extract_subscription(event.data.object)?;
                ProviderEvent::SubscriptionUpdated {
                    subscription_id: sub.id.to_string(),
                    cancel_at_period_end: sub.cancel_at_period_end,
                    past_due: sub.status == SubscriptionStatus::PastDue,
                    period_end: OffsetDateTime::from_unix_timestamp(sub.current_period_end).ok(),
                }
            }
            EventType::CustomerSubscriptionDeleted => {
                let sub = extract_subscription(event.data.object)?;
                ProviderEvent::SubscriptionCancelled {
                    subscription_id: sub.id.to_string(),
                }
            }
            _ => ProviderEvent::Ignored {
                event_type: event_type.clone(),
            },
        };

        Ok(VerifiedEvent {
            provider: ProviderKind::Stripe,
            event_id,
            event_type,
            event: normalized,
        })
    }
}

fn extract_subscription(object: EventObject) -> BillingResult<Subscription> {
    match object {
        EventObject::Subscription(sub) => Ok(sub),
        other => Err(BillingError::InvalidMetadata(format!(
            "subscription event carried {other:?}"
        ))),
    }
}

impl PaymentProvider for StripeGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> BillingResult<HostedCheckout> {
        let mut params = CreateCheckoutSession::new();
        params.success_url = Some(&self.config.success_url);
        params.cancel_url = Some(&self.config.cancel_url);

        let metadata: HashMap<String, String>;
        let line_item;
        match request {
            CheckoutRequest::Subscription {
                plan,
                email,
                yearly,
            } => {
                let interval = if *yearly {
                    CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Year
                } else {
                    CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month
                };
                let unit_amount = if *yearly {
                    plan.monthly_price_cents * 12
                } else {
                    plan.monthly_price_cents
                };

                metadata = CheckoutMetadata {
                    kind: CheckoutKind::Subscription,
                    plan_id: plan.id,
                    email: email.clone(),
                    yearly: *yearly,
                }
                .to_map();

                params.mode = Some(CheckoutSessionMode::Subscription);
                params.customer_email = Some(email);
                line_item = CreateCheckoutSessionLineItems {
                    quantity: Some(1),
                    price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                        currency: Currency::USD,
                        unit_amount: Some(unit_amount),
                        product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: plan.title.clone(),
                            ..Default::default()
                        }),
                        recurring: Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                            interval,
                            interval_count: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
            }
            CheckoutRequest::TokenPack { token_plan, email } => {
                metadata = CheckoutMetadata {
                    kind: CheckoutKind::Token,
                    plan_id: token_plan.id,
                    email: email.clone(),
                    yearly: false,
                }
                .to_map();

                params.mode = Some(CheckoutSessionMode::Payment);
                params.customer_email = Some(email);
                line_item = CreateCheckoutSessionLineItems {
                    quantity: Some(1),
                    price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                        currency: Currency::USD,
                        unit_amount: Some(token_plan.price_cents),
                        product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: token_plan.name.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
            }
        }

        params.line_items = Some(vec![line_item]);
        params.metadata = Some(metadata);

        let session = CheckoutSession::create(&self.client, params).await?;

        Ok(HostedCheckout {
            session_id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn verify_webhook(
        &self,
        payload: &str,
        headers: &WebhookHeaders,
    ) -> BillingResult<VerifiedEvent> {
        let signature = headers
            .stripe_signature
            .as_deref()
            .ok_or(BillingError::WebhookSignatureInvalid)?;
        let event = self.verify_event(payload, signature)?;
        self.normalize(event)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = SubscriptionId::from_str(subscription_id).map_err(|_| {
            BillingError::SubscriptionNotFound(subscription_id.to_string())
        })?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);
        Subscription::update(&self.client, &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            "Stripe subscription set to cancel at period end"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> StripeGateway {
        StripeGateway::new(StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_testsecret".to_string(),
            success_url: "https://example.com/ok".to_string(),
            cancel_url: "https://example.com/cancel".to_string(),
        })
    }

    /// Build a valid `stripe-signature` header for a payload using the
    /// manual-verification scheme.
    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={sig}")
    }

    #[test]
    fn rejects_garbage_signature() {
        let gw = gateway();
        let err = gw.verify_event("{}", "t=1,v1=deadbeef").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let gw = gateway();
        let payload = "{}";
        let stale = OffsetDateTime::now_utc().unix_timestamp() - 3600;
        let header = sign(payload, "whsec_testsecret", stale);
        let err = gw.verify_event(payload, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn rejects_wrong_secret() {
        let gw = gateway();
        let payload = "{}";
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(payload, "whsec_othersecret", now);
        let err = gw.verify_event(payload, &header).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }
}
