//! API error taxonomy
//!
//! Every handler returns `ApiResult<T>`; the `IntoResponse` impl maps each
//! variant to a status code and a JSON body. Internal failures are logged
//! with their source and answered with a generic message so database and
//! provider error text never reaches a client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use valora_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    /// Quota exhausted and the wallet cannot cover the action. The `reason`
    /// discriminator lets clients route the user to the top-up flow instead
    /// of a generic permission error.
    #[error("insufficient tokens")]
    InsufficientTokens,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("upstream payment provider error")]
    Upstream(#[source] BillingError),

    #[error("webhook signature verification failed")]
    WebhookSignature,

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::InsufficientTokens => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::WebhookSignature => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::InsufficientTokens => json!({
                "error": self.to_string(),
                "reason": "token",
            }),
            ApiError::Internal(source) => {
                tracing::error!(error = ?source, "internal error");
                json!({ "error": "internal error" })
            }
            ApiError::Upstream(source) => {
                tracing::error!(error = ?source, "payment provider error");
                json!({ "error": "payment provider error" })
            }
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("record"),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid => ApiError::WebhookSignature,
            BillingError::InvalidMetadata(msg) => ApiError::Validation(msg),
            BillingError::PlanNotFound(_) => ApiError::NotFound("plan"),
            BillingError::TokenPlanNotFound(_) => ApiError::NotFound("token plan"),
            BillingError::UserNotFound(_) => ApiError::NotFound("user"),
            BillingError::SubscriptionNotFound(_) | BillingError::NoProviderSubscription => {
                ApiError::NotFound("subscription")
            }
            upstream @ (BillingError::Stripe(_)
            | BillingError::PayPal(_)
            | BillingError::Http(_)) => ApiError::Upstream(upstream),
            other => ApiError::Internal(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_tokens_carries_reason() {
        let response = ApiError::InsufficientTokens.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_internal_error_hides_source() {
        let err = ApiError::Internal(anyhow::anyhow!("connection refused to db 10.0.0.3"));
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn test_row_not_found_maps_to_404() {
        let err: ApiError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
