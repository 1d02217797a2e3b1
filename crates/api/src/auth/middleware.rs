//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use uuid::Uuid;
use valora_shared::models::UserRole;

use crate::{error::ApiError, state::AppState};

/// Authenticated user information extracted from a validated JWT.
///
/// Handlers take this from request extensions; it only exists after
/// `require_auth` ran, so its presence is the authentication proof.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Require a valid JWT; inserts [`AuthUser`] into request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(&request).ok_or(ApiError::Unauthorized)?;
    let claims = state.jwt_manager.validate(token)?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        email: claims.email,
        role: claims.role,
    });

    Ok(next.run(request).await)
}

/// Require a valid JWT carrying the admin role. Runs after `require_auth`
/// would have, but does its own extraction so admin routes need only one
/// layer.
pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(&request).ok_or(ApiError::Unauthorized)?;
    let claims = state.jwt_manager.validate(token)?;

    if !claims.role.is_admin() {
        return Err(ApiError::Forbidden("admin role required".to_string()));
    }

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        email: claims.email,
        role: claims.role,
    });

    Ok(next.run(request).await)
}
