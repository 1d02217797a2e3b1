//! Billing event log
//!
//! Append-only audit of every reconciliation outcome. Webhook endpoints
//! acknowledge the provider even when internal reconciliation fails, so this
//! ledger is the place an out-of-band audit discovers those failures.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::provider::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    SubscriptionActivated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    TokensCredited,
    ReconciliationFailed,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionActivated => "subscription_activated",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionCancelled => "subscription_cancelled",
            BillingEventType::TokensCredited => "tokens_credited",
            BillingEventType::ReconciliationFailed => "reconciliation_failed",
        }
    }
}

/// A billing event under construction.
#[derive(Debug, Clone)]
pub struct NewBillingEvent {
    event_type: BillingEventType,
    user_id: Option<Uuid>,
    provider: Option<ProviderKind>,
    provider_event_id: Option<String>,
    provider_subscription_id: Option<String>,
    data: serde_json::Value,
}

impl NewBillingEvent {
    pub fn new(event_type: BillingEventType) -> Self {
        Self {
            event_type,
            user_id: None,
            provider: None,
            provider_event_id: None,
            provider_subscription_id: None,
            data: serde_json::json!({}),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn provider_event(mut self, event_id: &str) -> Self {
        self.provider_event_id = Some(event_id.to_string());
        self
    }

    pub fn provider_subscription(mut self, subscription_id: &str) -> Self {
        self.provider_subscription_id = Some(subscription_id.to_string());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, event: NewBillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (user_id, event_type, provider, provider_event_id,
                 provider_subscription_id, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.provider.map(|p| p.as_str()))
        .bind(event.provider_event_id)
        .bind(event.provider_subscription_id)
        .bind(event.data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_strings_are_stable() {
        assert_eq!(
            BillingEventType::SubscriptionActivated.as_str(),
            "subscription_activated"
        );
        assert_eq!(
            BillingEventType::ReconciliationFailed.as_str(),
            "reconciliation_failed"
        );
    }

    #[test]
    fn builder_accumulates_fields() {
        let user = Uuid::new_v4();
        let event = NewBillingEvent::new(BillingEventType::TokensCredited)
            .user(user)
            .provider(ProviderKind::Paypal)
            .provider_event("WH-1")
            .data(serde_json::json!({"tokens": 500}));

        assert_eq!(event.user_id, Some(user));
        assert_eq!(event.provider, Some(ProviderKind::Paypal));
        assert_eq!(event.provider_event_id.as_deref(), Some("WH-1"));
        assert!(event.provider_subscription_id.is_none());
    }
}
