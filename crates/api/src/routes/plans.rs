//! Plan and token-pack catalog

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use valora_shared::models::{Plan, PlanRow, TokenPlan};
use valora_shared::quota::Quota;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    let rows: Vec<PlanRow> = sqlx::query_as(
        r#"
        SELECT id, title, monthly_price_cents, features, is_popular, is_yearly,
               paypal_plan_id, geo_listing, geo_search_tokens, product_valuation
        FROM plans
        ORDER BY monthly_price_cents ASC
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows.into_iter().map(Plan::from).collect()))
}

pub async fn list_token_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<TokenPlan>>> {
    let plans: Vec<TokenPlan> = sqlx::query_as(
        "SELECT id, name, price_cents, tokens FROM token_plans ORDER BY price_cents ASC",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(plans))
}

#[derive(Debug, Deserialize)]
pub struct PlanPayload {
    pub title: String,
    pub monthly_price_cents: i64,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub is_popular: bool,
    #[serde(default)]
    pub is_yearly: bool,
    pub paypal_plan_id: Option<String>,
    pub geo_listing: Quota,
    pub geo_search_tokens: Quota,
    pub product_valuation: Quota,
}

impl PlanPayload {
    fn validate(&self) -> ApiResult<()> {
        if self.title.trim().is_empty() {
            return Err(ApiError::Validation("title is required".to_string()));
        }
        if self.monthly_price_cents < 0 {
            return Err(ApiError::Validation("price cannot be negative".to_string()));
        }
        Ok(())
    }
}

pub async fn create_plan(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(payload): Json<PlanPayload>,
) -> ApiResult<Json<Plan>> {
    payload.validate()?;

    let row: PlanRow = sqlx::query_as(
        r#"
        INSERT INTO plans (title, monthly_price_cents, features, is_popular, is_yearly,
                           paypal_plan_id, geo_listing, geo_search_tokens, product_valuation)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id, title, monthly_price_cents, features, is_popular, is_yearly,
                  paypal_plan_id, geo_listing, geo_search_tokens, product_valuation
        "#,
    )
    .bind(payload.title.trim())
    .bind(payload.monthly_price_cents)
    .bind(serde_json::json!(payload.features))
    .bind(payload.is_popular)
    .bind(payload.is_yearly)
    .bind(&payload.paypal_plan_id)
    .bind(payload.geo_listing.to_db())
    .bind(payload.geo_search_tokens.to_db())
    .bind(payload.product_valuation.to_db())
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(admin = %admin.user_id, plan = %row.id, "plan created");
    Ok(Json(row.into()))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
    Json(payload): Json<PlanPayload>,
) -> ApiResult<Json<Plan>> {
    payload.validate()?;

    let row: Option<PlanRow> = sqlx::query_as(
        r#"
        UPDATE plans
        SET title = $1, monthly_price_cents = $2, features = $3, is_popular = $4,
            is_yearly = $5, paypal_plan_id = $6, geo_listing = $7,
            geo_search_tokens = $8, product_valuation = $9
        WHERE id = $10
        RETURNING id, title, monthly_price_cents, features, is_popular, is_yearly,
                  paypal_plan_id, geo_listing, geo_search_tokens, product_valuation
        "#,
    )
    .bind(payload.title.trim())
    .bind(payload.monthly_price_cents)
    .bind(serde_json::json!(payload.features))
    .bind(payload.is_popular)
    .bind(payload.is_yearly)
    .bind(&payload.paypal_plan_id)
    .bind(payload.geo_listing.to_db())
    .bind(payload.geo_search_tokens.to_db())
    .bind(payload.product_valuation.to_db())
    .bind(plan_id)
    .fetch_optional(&state.pool)
    .await?;

    row.map(|r| Json(Plan::from(r)))
        .ok_or(ApiError::NotFound("plan"))
}

/// Deleting a plan nulls `plan_id` on existing subscriptions (FK is SET
/// NULL); their snapshot quotas are untouched, so current subscribers keep
/// what they paid for.
pub async fn delete_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = sqlx::query("DELETE FROM plans WHERE id = $1")
        .bind(plan_id)
        .execute(&state.pool)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(ApiError::NotFound("plan"));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct TokenPlanPayload {
    pub name: String,
    pub price_cents: i64,
    pub tokens: i64,
}

pub async fn create_token_plan(
    State(state): State<AppState>,
    Json(payload): Json<TokenPlanPayload>,
) -> ApiResult<Json<TokenPlan>> {
    if payload.tokens <= 0 || payload.price_cents < 0 {
        return Err(ApiError::Validation(
            "token pack must grant tokens at a non-negative price".to_string(),
        ));
    }

    let plan: TokenPlan = sqlx::query_as(
        r#"
        INSERT INTO token_plans (name, price_cents, tokens)
        VALUES ($1, $2, $3)
        RETURNING id, name, price_cents, tokens
        "#,
    )
    .bind(payload.name.trim())
    .bind(payload.price_cents)
    .bind(payload.tokens)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(plan))
}

pub async fn delete_token_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = sqlx::query("DELETE FROM token_plans WHERE id = $1")
        .bind(plan_id)
        .execute(&state.pool)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(ApiError::NotFound("token plan"));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}
