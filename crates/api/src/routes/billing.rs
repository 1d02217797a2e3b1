//! Checkout, webhooks and subscription management endpoints

use axum::{
    extract::State,
    http::HeaderMap,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use valora_billing::{
    CheckoutRequest, HostedCheckout, InvariantCheckSummary, ProviderKind, WebhookHeaders,
};
use valora_shared::models::{Plan, PlanRow, TokenPlan};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutPayload {
    /// Plan title for a subscription checkout
    pub plan_title: Option<String>,
    /// Token pack id for a one-time purchase
    pub token_plan_id: Option<Uuid>,
    #[serde(default)]
    pub yearly: bool,
}

async fn build_checkout_request(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutPayload,
) -> ApiResult<CheckoutRequest> {
    match (payload.plan_title, payload.token_plan_id) {
        (Some(title), None) => {
            let row: Option<PlanRow> = sqlx::query_as(
                r#"
                SELECT id, title, monthly_price_cents, features, is_popular, is_yearly,
                       paypal_plan_id, geo_listing, geo_search_tokens, product_valuation
                FROM plans WHERE title = $1
                "#,
            )
            .bind(&title)
            .fetch_optional(&state.pool)
            .await?;
            let plan: Plan = row.map(Plan::from).ok_or(ApiError::NotFound("plan"))?;
            Ok(CheckoutRequest::Subscription {
                plan,
                email: user.email.clone(),
                yearly: payload.yearly,
            })
        }
        (None, Some(token_plan_id)) => {
            let token_plan: Option<TokenPlan> = sqlx::query_as(
                "SELECT id, name, price_cents, tokens FROM token_plans WHERE id = $1",
            )
            .bind(token_plan_id)
            .fetch_optional(&state.pool)
            .await?;
            Ok(CheckoutRequest::TokenPack {
                token_plan: token_plan.ok_or(ApiError::NotFound("token plan"))?,
                email: user.email.clone(),
            })
        }
        _ => Err(ApiError::Validation(
            "exactly one of plan_title or token_plan_id is required".to_string(),
        )),
    }
}

pub async fn stripe_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CheckoutPayload>,
) -> ApiResult<Json<HostedCheckout>> {
    let request = build_checkout_request(&state, &user, payload).await?;
    let checkout = state
        .billing
        .create_checkout(ProviderKind::Stripe, request)
        .await?;
    Ok(Json(checkout))
}

pub async fn paypal_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CheckoutPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let request = build_checkout_request(&state, &user, payload).await?;
    let checkout = state
        .billing
        .create_checkout(ProviderKind::Paypal, request)
        .await?;
    Ok(Json(json!({
        "order_id": checkout.session_id,
        "approval_url": checkout.url,
    })))
}

fn webhook_headers(headers: &HeaderMap) -> WebhookHeaders {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    WebhookHeaders {
        stripe_signature: get("stripe-signature"),
        paypal_transmission_id: get("paypal-transmission-id"),
        paypal_transmission_time: get("paypal-transmission-time"),
        paypal_transmission_sig: get("paypal-transmission-sig"),
        paypal_cert_url: get("paypal-cert-url"),
        paypal_auth_algo: get("paypal-auth-algo"),
    }
}

/// Shared webhook flow: verify (400 on failure, nothing mutated), then run
/// idempotent processing. A reconciliation failure is logged and audited but
/// still acknowledged; provider retries would hit the same failure, and the
/// billing event ledger is the recovery path.
async fn handle_webhook(
    state: AppState,
    provider: ProviderKind,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let verified = state
        .billing
        .verify_webhook(provider, &body, &webhook_headers(&headers))
        .await?;

    tracing::info!(
        provider = %provider,
        event_id = %verified.event_id,
        event_type = %verified.event_type,
        "webhook verified"
    );

    if let Err(err) = state.billing.webhooks.process(&verified).await {
        tracing::error!(
            provider = %provider,
            event_id = %verified.event_id,
            error = ?err,
            "webhook reconciliation failed"
        );
    }

    Ok(Json(json!({ "received": true })))
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    handle_webhook(state, ProviderKind::Stripe, headers, body).await
}

pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    handle_webhook(state, ProviderKind::Paypal, headers, body).await
}

#[derive(Debug, sqlx::FromRow)]
struct ProviderRefs {
    stripe_subscription_id: Option<String>,
    paypal_subscription_id: Option<String>,
}

/// Cancel at period end via whichever provider id the subscription carries.
/// The status transition itself lands through the provider's webhook.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let refs: ProviderRefs = sqlx::query_as(
        r#"
        SELECT stripe_subscription_id, paypal_subscription_id
        FROM subscriptions
        WHERE user_id = $1
        "#,
    )
    .bind(user.user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound("subscription"))?;

    match (refs.stripe_subscription_id, refs.paypal_subscription_id) {
        (Some(sub_id), None) => {
            state
                .billing
                .cancel_subscription(ProviderKind::Stripe, &sub_id)
                .await?;
        }
        (None, Some(sub_id)) => {
            state
                .billing
                .cancel_subscription(ProviderKind::Paypal, &sub_id)
                .await?;
        }
        _ => return Err(ApiError::NotFound("subscription")),
    }

    tracing::info!(user_id = %user.user_id, "cancellation requested");
    Ok(Json(json!({ "canceling": true })))
}

#[derive(Debug, sqlx::FromRow, serde::Serialize)]
pub struct SubscriptionStatusView {
    pub status: String,
    pub plan_title: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub is_yearly: bool,
    pub provider: Option<String>,
}

pub async fn subscription_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatusView>> {
    let view: SubscriptionStatusView = sqlx::query_as(
        r#"
        SELECT s.status, p.title AS plan_title, s.start_date, s.end_date,
               s.cancel_at_period_end, s.is_yearly,
               CASE
                   WHEN s.stripe_subscription_id IS NOT NULL THEN 'stripe'
                   WHEN s.paypal_subscription_id IS NOT NULL THEN 'paypal'
               END AS provider
        FROM subscriptions s
        LEFT JOIN plans p ON p.id = s.plan_id
        WHERE s.user_id = $1
        "#,
    )
    .bind(user.user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound("subscription"))?;

    Ok(Json(view))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "billing invariant violations found"
        );
    }
    Ok(Json(summary))
}
