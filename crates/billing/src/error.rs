//! Billing error taxonomy

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Webhook payload failed signature/authenticity verification.
    /// The HTTP layer must answer 400 and perform no mutation.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Event carried metadata we could not interpret.
    #[error("invalid checkout metadata: {0}")]
    InvalidMetadata(String),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("token plan not found: {0}")]
    TokenPlanNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    /// No subscription row carries the provider subscription id the event names.
    #[error("no subscription with provider id {0}")]
    SubscriptionNotFound(String),

    #[error("subscription has no cancellable provider reference")]
    NoProviderSubscription,

    #[error("Stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    /// PayPal REST call failed or returned an unexpected shape.
    #[error("PayPal error: {0}")]
    PayPal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}
