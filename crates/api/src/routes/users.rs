//! User profile and admin user management

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use valora_shared::quota::Quota;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    email: String,
    role: String,
    tokens: i64,
    status: String,
    plan_title: Option<String>,
    end_date: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    geo_listing: Option<i32>,
    geo_search_tokens: Option<i32>,
    product_valuation: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub tokens: i64,
    pub subscription: SubscriptionView,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub status: String,
    pub plan_title: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub geo_listing: Quota,
    pub geo_search_tokens: Quota,
    pub product_valuation: Quota,
}

pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Profile>> {
    let row: ProfileRow = sqlx::query_as(
        r#"
        SELECT u.id, u.email, u.role, u.tokens,
               s.status, p.title AS plan_title, s.end_date, s.cancel_at_period_end,
               s.geo_listing, s.geo_search_tokens, s.product_valuation
        FROM users u
        JOIN subscriptions s ON s.user_id = u.id
        LEFT JOIN plans p ON p.id = s.plan_id
        WHERE u.id = $1
        "#,
    )
    .bind(user.user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::NotFound("user"))?;

    Ok(Json(Profile {
        id: row.id,
        email: row.email,
        role: row.role,
        tokens: row.tokens,
        subscription: SubscriptionView {
            status: row.status,
            plan_title: row.plan_title,
            end_date: row.end_date,
            cancel_at_period_end: row.cancel_at_period_end,
            geo_listing: Quota::from_db(row.geo_listing),
            geo_search_tokens: Quota::from_db(row.geo_search_tokens),
            product_valuation: Quota::from_db(row.product_valuation),
        },
    }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub tokens: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<UserSummary>>> {
    let users: Vec<UserSummary> = sqlx::query_as(
        "SELECT id, email, role, tokens, created_at FROM users ORDER BY created_at DESC",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(users))
}

#[derive(Debug, Deserialize)]
pub struct SetTokensRequest {
    pub tokens: i64,
}

/// Admin adjustment of a user's token wallet.
pub async fn set_tokens(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<SetTokensRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if payload.tokens < 0 {
        return Err(ApiError::Validation("tokens cannot be negative".to_string()));
    }

    let updated = sqlx::query("UPDATE users SET tokens = $1, updated_at = NOW() WHERE id = $2")
        .bind(payload.tokens)
        .bind(user_id)
        .execute(&state.pool)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound("user"));
    }

    tracing::info!(
        admin = %admin.user_id,
        user_id = %user_id,
        tokens = payload.tokens,
        "admin set token balance"
    );

    Ok(Json(serde_json::json!({ "updated": true })))
}
