//! Category tree with per-viewer visibility
//!
//! Three levels: categories, subcategories, second subcategories. Each node
//! is either global (`owner_email` NULL) or owned by the email that created
//! it. Visibility is a pure predicate so the matrix (global/owned ×
//! anonymous/owner/other) is unit tested without a database.

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// A node is visible to a viewer iff it is global or owned by that viewer.
/// Anonymous viewers see only global nodes.
pub fn visible_to(owner_email: Option<&str>, viewer: Option<&str>) -> bool {
    match owner_email {
        None => true,
        Some(owner) => viewer == Some(owner),
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CategoryNode {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub owner_email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CategoryTree {
    pub id: Uuid,
    pub name: String,
    pub subcategories: Vec<SubcategoryTree>,
}

#[derive(Debug, Serialize)]
pub struct SubcategoryTree {
    pub id: Uuid,
    pub name: String,
    pub second_subcategories: Vec<CategoryNode>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubRow {
    id: Uuid,
    category_id: Uuid,
    name: String,
    owner_email: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SecondRow {
    id: Uuid,
    subcategory_id: Uuid,
    name: String,
    owner_email: Option<String>,
}

/// Viewer identity for the tree endpoint: taken from a bearer token when one
/// is presented, otherwise anonymous. An invalid token degrades to anonymous
/// rather than erroring; this endpoint is public.
fn viewer_email(state: &AppState, headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .and_then(|token| state.jwt_manager.validate(token).ok())
        .map(|claims| claims.email)
}

pub async fn get_tree(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<CategoryTree>>> {
    let viewer = viewer_email(&state, &headers);
    let viewer = viewer.as_deref();

    let categories: Vec<CategoryNode> =
        sqlx::query_as("SELECT id, name, owner_email FROM categories ORDER BY name")
            .fetch_all(&state.pool)
            .await?;
    let subs: Vec<SubRow> = sqlx::query_as(
        "SELECT id, category_id, name, owner_email FROM subcategories ORDER BY name",
    )
    .fetch_all(&state.pool)
    .await?;
    let seconds: Vec<SecondRow> = sqlx::query_as(
        "SELECT id, subcategory_id, name, owner_email FROM second_subcategories ORDER BY name",
    )
    .fetch_all(&state.pool)
    .await?;

    let tree = categories
        .into_iter()
        .filter(|c| visible_to(c.owner_email.as_deref(), viewer))
        .map(|category| {
            let subcategories = subs
                .iter()
                .filter(|s| {
                    s.category_id == category.id && visible_to(s.owner_email.as_deref(), viewer)
                })
                .map(|sub| SubcategoryTree {
                    id: sub.id,
                    name: sub.name.clone(),
                    second_subcategories: seconds
                        .iter()
                        .filter(|sec| {
                            sec.subcategory_id == sub.id
                                && visible_to(sec.owner_email.as_deref(), viewer)
                        })
                        .map(|sec| CategoryNode {
                            id: sec.id,
                            name: sec.name.clone(),
                            owner_email: sec.owner_email.clone(),
                        })
                        .collect(),
                })
                .collect();

            CategoryTree {
                id: category.id,
                name: category.name,
                subcategories,
            }
        })
        .collect();

    Ok(Json(tree))
}

#[derive(Debug, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
    /// Admins may create global nodes; user submissions are always stamped
    /// with their own email.
    #[serde(default)]
    pub global: bool,
}

fn owner_for(user: &AuthUser, global: bool) -> Option<String> {
    if global && user.is_admin() {
        None
    } else {
        Some(user.email.clone())
    }
}

pub async fn create_category(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateCategoryRequest>,
) -> ApiResult<Json<CategoryNode>> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }

    let node: CategoryNode = sqlx::query_as(
        "INSERT INTO categories (name, owner_email) VALUES ($1, $2) RETURNING id, name, owner_email",
    )
    .bind(payload.name.trim())
    .bind(owner_for(&user, payload.global))
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(node))
}

#[derive(Debug, Deserialize)]
pub struct CreateSubcategoryRequest {
    pub category_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub global: bool,
}

pub async fn create_subcategory(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateSubcategoryRequest>,
) -> ApiResult<Json<CategoryNode>> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }

    let node: Option<CategoryNode> = sqlx::query_as(
        r#"
        INSERT INTO subcategories (category_id, name, owner_email)
        SELECT id, $2, $3 FROM categories WHERE id = $1
        RETURNING id, name, owner_email
        "#,
    )
    .bind(payload.category_id)
    .bind(payload.name.trim())
    .bind(owner_for(&user, payload.global))
    .fetch_optional(&state.pool)
    .await?;

    node.map(Json).ok_or(ApiError::NotFound("category"))
}

#[derive(Debug, Deserialize)]
pub struct CreateSecondSubcategoryRequest {
    pub subcategory_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub global: bool,
}

pub async fn create_second_subcategory(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateSecondSubcategoryRequest>,
) -> ApiResult<Json<CategoryNode>> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }

    let node: Option<CategoryNode> = sqlx::query_as(
        r#"
        INSERT INTO second_subcategories (subcategory_id, name, owner_email)
        SELECT id, $2, $3 FROM subcategories WHERE id = $1
        RETURNING id, name, owner_email
        "#,
    )
    .bind(payload.subcategory_id)
    .bind(payload.name.trim())
    .bind(owner_for(&user, payload.global))
    .fetch_optional(&state.pool)
    .await?;

    node.map(Json).ok_or(ApiError::NotFound("subcategory"))
}

/// Admin removal of a top-level category; children cascade.
pub async fn delete_category(
    State(state): State<AppState>,
    Path(category_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = sqlx::query("DELETE FROM categories WHERE id = $1")
        .bind(category_id)
        .execute(&state.pool)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(ApiError::NotFound("category"));
    }
    Ok(Json(json!({ "deleted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_nodes_visible_to_everyone() {
        assert!(visible_to(None, None));
        assert!(visible_to(None, Some("a@example.com")));
    }

    #[test]
    fn test_owned_nodes_visible_only_to_owner() {
        assert!(visible_to(Some("a@example.com"), Some("a@example.com")));
        assert!(!visible_to(Some("a@example.com"), Some("b@example.com")));
    }

    #[test]
    fn test_anonymous_sees_only_global() {
        assert!(!visible_to(Some("a@example.com"), None));
    }
}
