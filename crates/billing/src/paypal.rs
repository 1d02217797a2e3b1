//! PayPal adapter
//!
//! PayPal has no maintained Rust SDK, so this adapter speaks the REST API
//! directly: client-credentials OAuth, the Subscriptions API for plans, the
//! Orders API for token packs, and the `verify-webhook-signature` endpoint
//! for webhook authenticity. Checkout metadata rides in `custom_id` as JSON.

use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutKind, CheckoutMetadata, CheckoutRequest, HostedCheckout, PaymentProvider,
    ProviderEvent, ProviderKind, VerifiedEvent, WebhookHeaders,
};

const LIVE_API_BASE: &str = "https://api-m.paypal.com";

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Webhook id registered in the PayPal dashboard; required by the
    /// verify-webhook-signature call.
    pub webhook_id: String,
    pub api_base: String,
    pub return_url: String,
    pub cancel_url: String,
}

impl PayPalConfig {
    pub fn from_env() -> BillingResult<PayPalConfig> {
        let get = |key: &str| {
            std::env::var(key).map_err(|_| BillingError::Config(format!("{key} not set")))
        };
        Ok(PayPalConfig {
            client_id: get("PAYPAL_CLIENT_ID")?,
            client_secret: get("PAYPAL_CLIENT_SECRET")?,
            webhook_id: get("PAYPAL_WEBHOOK_ID")?,
            api_base: std::env::var("PAYPAL_API_BASE")
                .unwrap_or_else(|_| LIVE_API_BASE.to_string()),
            return_url: get("CHECKOUT_SUCCESS_URL")?,
            cancel_url: get("CHECKOUT_CANCEL_URL")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

/// PayPal payment adapter.
#[derive(Clone)]
pub struct PayPalGateway {
    http: Client,
    config: PayPalConfig,
}

impl PayPalGateway {
    pub fn new(http: Client, config: PayPalConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &PayPalConfig {
        &self.config
    }

    /// Fetch a client-credentials access token.
    async fn access_token(&self) -> BillingResult<String> {
        let credentials = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.config.client_id, self.config.client_secret
        ));

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .header("Authorization", format!("Basic {credentials}"))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BillingError::PayPal(format!(
                "oauth token request failed with {status}"
            )));
        }

        let token: OAuthTokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    /// Extract the approval link from a PayPal HATEOAS `links` array.
    fn approval_url(body: &Value) -> Option<String> {
        body.get("links")?.as_array()?.iter().find_map(|link| {
            let rel = link.get("rel")?.as_str()?;
            if rel == "approve" || rel == "approval_url" {
                link.get("href")?.as_str().map(str::to_string)
            } else {
                None
            }
        })
    }

    /// Normalize a verified PayPal webhook body.
    fn normalize(&self, body: &Value) -> BillingResult<VerifiedEvent> {
        let event_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::PayPal("webhook body missing id".to_string()))?
            .to_string();
        let event_type = body
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or_else(|| BillingError::PayPal("webhook body missing event_type".to_string()))?
            .to_string();
        let resource = body.get("resource").cloned().unwrap_or(Value::Null);

        let normalized = match event_type.as_str() {
            "BILLING.SUBSCRIPTION.ACTIVATED" => {
                let metadata = resource
                    .get("custom_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BillingError::InvalidMetadata("activation without custom_id".to_string())
                    })
                    .and_then(CheckoutMetadata::from_custom_id)?;

                if metadata.kind == CheckoutKind::Token {
                    // A token pack can never arrive as a billing subscription.
                    return Err(BillingError::InvalidMetadata(
                        "token metadata on subscription activation".to_string(),
                    ));
                }

                let subscription_id = resource
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BillingError::PayPal("activation resource missing id".to_string())
                    })?
                    .to_string();
                let payer_ref = resource
                    .pointer("/subscriber/payer_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let period_end = resource
                    .pointer("/billing_info/next_billing_time")
                    .and_then(Value::as_str)
                    .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());

                ProviderEvent::SubscriptionActivated {
                    email: metadata.email,
                    plan_id: metadata.plan_id,
                    subscription_id,
                    customer_ref: None,
                    payer_ref,
                    period_end,
                    is_yearly: metadata.yearly,
                }
            }
            "BILLING.SUBSCRIPTION.UPDATED" | "BILLING.SUBSCRIPTION.SUSPENDED" => {
                let subscription_id = resource
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BillingError::PayPal("update resource missing id".to_string()))?
                    .to_string();
                let status = resource
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let period_end = resource
                    .pointer("/billing_info/next_billing_time")
                    .and_then(Value::as_str)
                    .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());

                ProviderEvent::SubscriptionUpdated {
                    subscription_id,
                    cancel_at_period_end: status == "SUSPENDED",
                    past_due: false,
                    period_end,
                }
            }
            "BILLING.SUBSCRIPTION.CANCELLED" => {
                let subscription_id = resource
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BillingError::PayPal("cancel resource missing id".to_string()))?
                    .to_string();
                ProviderEvent::SubscriptionCancelled { subscription_id }
            }
            "PAYMENT.CAPTURE.COMPLETED" | "CHECKOUT.ORDER.APPROVED" => {
                // Token pack purchases arrive as order/capture events; the
                // custom_id tag decides, never the event type alone.
                match resource.get("custom_id").and_then(Value::as_str) {
                    Some(raw) => {
                        let metadata = CheckoutMetadata::from_custom_id(raw)?;
                        match metadata.kind {
                            CheckoutKind::Token => ProviderEvent::TokenPackPurchased {
                                email: metadata.email,
                                token_plan_id: metadata.plan_id,
                            },
                            CheckoutKind::Subscription => ProviderEvent::Ignored {
                                event_type: event_type.clone(),
                            },
                        }
                    }
                    None => ProviderEvent::Ignored {
                        event_type: event_type.clone(),
                    },
                }
            }
            _ => ProviderEvent::Ignored {
                event_type: event_type.clone(),
            },
        };

        Ok(VerifiedEvent {
            provider: ProviderKind::Paypal,
            event_id,
            event_type,
            event: normalized,
        })
    }
}

impl PaymentProvider for PayPalGateway {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Paypal
    }

    async fn create_checkout(&self, request: &CheckoutRequest) -> BillingResult<HostedCheckout> {
        let token = self.access_token().await?;

        match request {
            CheckoutRequest::Subscription {
                plan,
                email,
                yearly,
            } => {
                let paypal_plan_id = plan.paypal_plan_id.as_deref().ok_or_else(|| {
                    BillingError::PayPal(format!("plan '{}' has no PayPal plan id", plan.title))
                })?;
                let custom_id = CheckoutMetadata {
                    kind: CheckoutKind::Subscription,
                    plan_id: plan.id,
                    email: email.clone(),
                    yearly: *yearly,
                }
                .to_custom_id()?;

                let response = self
                    .http
                    .post(format!(
                        "{}/v1/billing/subscriptions",
                        self.config.api_base
                    ))
                    .bearer_auth(&token)
                    .json(&json!({
                        "plan_id": paypal_plan_id,
                        "custom_id": custom_id,
                        "subscriber": { "email_address": email },
                        "application_context": {
                            "return_url": self.config.return_url,
                            "cancel_url": self.config.cancel_url,
                        },
                    }))
                    .send()
                    .await?;

                if !response.status().is_success() {
                    let status = response.status();
                    return Err(BillingError::PayPal(format!(
                        "subscription creation failed with {status}"
                    )));
                }

                let body: Value = response.json().await?;
                let id = body
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BillingError::PayPal("subscription missing id".to_string()))?
                    .to_string();

                Ok(HostedCheckout {
                    session_id: id,
                    url: Self::approval_url(&body),
                })
            }
            CheckoutRequest::TokenPack { token_plan, email } => {
                let custom_id = CheckoutMetadata {
                    kind: CheckoutKind::Token,
                    plan_id: token_plan.id,
                    email: email.clone(),
                    yearly: false,
                }
                .to_custom_id()?;
                let value = format!(
                    "{}.{:02}",
                    token_plan.price_cents / 100,
                    token_plan.price_cents % 100
                );

                let response = self
                    .http
                    .post(format!("{}/v2/checkout/orders", self.config.api_base))
                    .bearer_auth(&token)
                    .json(&json!({
                        "intent": "CAPTURE",
                        "purchase_units": [{
                            "custom_id": custom_id,
                            "description": token_plan.name,
                            "amount": { "currency_code": "USD", "value": value },
                        }],
                        "application_context": {
                            "return_url": self.config.return_url,
                            "cancel_url": self.config.cancel_url,
                        },
                    }))
                    .send()
                    .await?;

                if !response.status().is_success() {
                    let status = response.status();
                    return Err(BillingError::PayPal(format!(
                        "order creation failed with {status}"
                    )));
                }

                let body: Value = response.json().await?;
                let id = body
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BillingError::PayPal("order missing id".to_string()))?
                    .to_string();

                Ok(HostedCheckout {
                    session_id: id,
                    url: Self::approval_url(&body),
                })
            }
        }
    }

    async fn verify_webhook(
        &self,
        payload: &str,
        headers: &WebhookHeaders,
    ) -> BillingResult<VerifiedEvent> {
        let body: Value = serde_json::from_str(payload)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;

        let require = |v: &Option<String>| {
            v.clone().ok_or(BillingError::WebhookSignatureInvalid)
        };

        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.config.api_base
            ))
            .bearer_auth(&token)
            .json(&json!({
                "auth_algo": require(&headers.paypal_auth_algo)?,
                "cert_url": require(&headers.paypal_cert_url)?,
                "transmission_id": require(&headers.paypal_transmission_id)?,
                "transmission_sig": require(&headers.paypal_transmission_sig)?,
                "transmission_time": require(&headers.paypal_transmission_time)?,
                "webhook_id": self.config.webhook_id,
                "webhook_event": body,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::error!(status = %response.status(), "PayPal verify call failed");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let verdict: VerifySignatureResponse = response.json().await?;
        if verdict.verification_status != "SUCCESS" {
            tracing::error!(
                verification_status = %verdict.verification_status,
                "PayPal webhook signature rejected"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        self.normalize(&body)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!(
                "{}/v1/billing/subscriptions/{}/cancel",
                self.config.api_base, subscription_id
            ))
            .bearer_auth(&token)
            .json(&json!({ "reason": "Cancelled by customer" }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BillingError::PayPal(format!(
                "cancellation failed with {status}"
            )));
        }

        tracing::info!(subscription_id = %subscription_id, "PayPal subscription cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn gateway(api_base: &str) -> PayPalGateway {
        PayPalGateway::new(
            Client::new(),
            PayPalConfig {
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                webhook_id: "WH-123".to_string(),
                api_base: api_base.to_string(),
                return_url: "https://example.com/ok".to_string(),
                cancel_url: "https://example.com/cancel".to_string(),
            },
        )
    }

    fn custom_id(kind: CheckoutKind, plan_id: Uuid) -> String {
        CheckoutMetadata {
            kind,
            plan_id,
            email: "buyer@example.com".to_string(),
            yearly: false,
        }
        .to_custom_id()
        .unwrap()
    }

    #[test]
    fn normalizes_activation() {
        let gw = gateway(LIVE_API_BASE);
        let plan_id = Uuid::new_v4();
        let body = json!({
            "id": "WH-EVT-1",
            "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
            "resource": {
                "id": "I-SUB123",
                "custom_id": custom_id(CheckoutKind::Subscription, plan_id),
                "subscriber": { "payer_id": "PAYER9", "email_address": "buyer@example.com" },
                "billing_info": { "next_billing_time": "2026-09-28T00:00:00Z" },
            },
        });

        let verified = gw.normalize(&body).unwrap();
        assert_eq!(verified.provider, ProviderKind::Paypal);
        assert_eq!(verified.event_id, "WH-EVT-1");
        match verified.event {
            ProviderEvent::SubscriptionActivated {
                email,
                plan_id: got_plan,
                subscription_id,
                payer_ref,
                period_end,
                ..
            } => {
                assert_eq!(email, "buyer@example.com");
                assert_eq!(got_plan, plan_id);
                assert_eq!(subscription_id, "I-SUB123");
                assert_eq!(payer_ref.as_deref(), Some("PAYER9"));
                assert!(period_end.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn suspension_maps_to_cancel_at_period_end() {
        let gw = gateway(LIVE_API_BASE);
        let body = json!({
            "id": "WH-EVT-2",
            "event_type": "BILLING.SUBSCRIPTION.SUSPENDED",
            "resource": { "id": "I-SUB123", "status": "SUSPENDED" },
        });

        let verified = gw.normalize(&body).unwrap();
        match verified.event {
            ProviderEvent::SubscriptionUpdated {
                cancel_at_period_end,
                ..
            } => assert!(cancel_at_period_end),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn capture_with_token_metadata_is_token_purchase() {
        let gw = gateway(LIVE_API_BASE);
        let plan_id = Uuid::new_v4();
        let body = json!({
            "id": "WH-EVT-3",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": { "id": "CAP-1", "custom_id": custom_id(CheckoutKind::Token, plan_id) },
        });

        let verified = gw.normalize(&body).unwrap();
        match verified.event {
            ProviderEvent::TokenPackPurchased { token_plan_id, .. } => {
                assert_eq!(token_plan_id, plan_id)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn capture_without_custom_id_is_ignored() {
        let gw = gateway(LIVE_API_BASE);
        let body = json!({
            "id": "WH-EVT-4",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": { "id": "CAP-2" },
        });

        let verified = gw.normalize(&body).unwrap();
        assert!(matches!(verified.event, ProviderEvent::Ignored { .. }));
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let gw = gateway(LIVE_API_BASE);
        let body = json!({
            "id": "WH-EVT-5",
            "event_type": "CUSTOMER.DISPUTE.CREATED",
            "resource": {},
        });

        let verified = gw.normalize(&body).unwrap();
        assert!(matches!(verified.event, ProviderEvent::Ignored { .. }));
    }

    #[tokio::test]
    async fn verify_webhook_rejects_failed_verdict() {
        let mut server = mockito::Server::new_async().await;
        let _oauth = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"tok","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;
        let _verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .with_status(200)
            .with_body(r#"{"verification_status":"FAILURE"}"#)
            .create_async()
            .await;

        let gw = gateway(&server.url());
        let headers = WebhookHeaders {
            paypal_transmission_id: Some("t-id".to_string()),
            paypal_transmission_time: Some("2026-08-28T00:00:00Z".to_string()),
            paypal_transmission_sig: Some("sig".to_string()),
            paypal_cert_url: Some("https://api.paypal.com/cert".to_string()),
            paypal_auth_algo: Some("SHA256withRSA".to_string()),
            ..Default::default()
        };

        let err = gw
            .verify_webhook(r#"{"id":"WH-EVT-6","event_type":"X"}"#, &headers)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[tokio::test]
    async fn verify_webhook_accepts_success_verdict() {
        let mut server = mockito::Server::new_async().await;
        let _oauth = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"tok","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;
        let _verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .with_status(200)
            .with_body(r#"{"verification_status":"SUCCESS"}"#)
            .create_async()
            .await;

        let gw = gateway(&server.url());
        let headers = WebhookHeaders {
            paypal_transmission_id: Some("t-id".to_string()),
            paypal_transmission_time: Some("2026-08-28T00:00:00Z".to_string()),
            paypal_transmission_sig: Some("sig".to_string()),
            paypal_cert_url: Some("https://api.paypal.com/cert".to_string()),
            paypal_auth_algo: Some("SHA256withRSA".to_string()),
            ..Default::default()
        };

        let payload = json!({
            "id": "WH-EVT-7",
            "event_type": "BILLING.SUBSCRIPTION.CANCELLED",
            "resource": { "id": "I-SUB123" },
        })
        .to_string();

        let verified = gw.verify_webhook(&payload, &headers).await.unwrap();
        assert!(matches!(
            verified.event,
            ProviderEvent::SubscriptionCancelled { .. }
        ));
    }

    #[tokio::test]
    async fn verify_webhook_rejects_missing_transmission_headers() {
        let mut server = mockito::Server::new_async().await;
        let _oauth = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"tok","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;

        let gw = gateway(&server.url());
        let err = gw
            .verify_webhook(
                r#"{"id":"WH-EVT-8","event_type":"X"}"#,
                &WebhookHeaders::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }
}
