//! Registration and login

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use valora_shared::models::UserRole;

use crate::auth::password::{hash_password, validate_password_strength, verify_password};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let email = payload.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("invalid email".to_string()));
    }
    validate_password_strength(&payload.password)?;

    let password_hash = hash_password(&payload.password)?;

    // The configured bootstrap email gets the admin role at registration;
    // all authorization decisions afterwards read the role column.
    let role = match &state.config.admin_email {
        Some(admin) if admin.eq_ignore_ascii_case(&email) => UserRole::Admin,
        _ => UserRole::User,
    };

    let mut tx = state.pool.begin().await?;

    let existing: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        return Err(ApiError::Validation("email already registered".to_string()));
    }

    let (user_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO users (email, password_hash, role)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(&email)
    .bind(&password_hash)
    .bind(role.as_str())
    .fetch_one(&mut *tx)
    .await?;

    // Every user carries a subscription row from day one; quota columns
    // default to the free tier in the schema.
    sqlx::query("INSERT INTO subscriptions (user_id) VALUES ($1)")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(user_id = %user_id, "user registered");

    let token = state.jwt_manager.issue(user_id, &email, role)?;
    Ok(Json(AuthResponse {
        token,
        user_id,
        email,
        role,
    }))
}

#[derive(Debug, sqlx::FromRow)]
struct LoginRow {
    id: Uuid,
    password_hash: String,
    role: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let email = payload.email.trim().to_lowercase();

    let row: Option<LoginRow> =
        sqlx::query_as("SELECT id, password_hash, role FROM users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&state.pool)
            .await?;

    // Same failure for unknown email and wrong password
    let row = row.ok_or(ApiError::Unauthorized)?;
    if !verify_password(&payload.password, &row.password_hash) {
        return Err(ApiError::Unauthorized);
    }

    let role = UserRole::from_str(&row.role);
    let token = state.jwt_manager.issue(row.id, &email, role)?;

    Ok(Json(AuthResponse {
        token,
        user_id: row.id,
        email,
        role,
    }))
}
