//! Product catalog: CRUD, seeded-shuffle listing, social toggles, vendors,
//! saved listings

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::QueryBuilder;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::quota::{charge_quota, charge_quota_standalone, MeteredAction};
use crate::shuffle::{generate_seed, shuffle_seeded};
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Product {
    pub id: Uuid,
    pub product_id: String,
    pub title: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub source_url: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub second_subcategory: Option<String>,
    pub saved_by: String,
    pub favourites_count: i32,
    pub followers_count: i32,
    pub views_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const PRODUCT_COLUMNS: &str = "id, product_id, title, price_cents, image_url, source_url, \
     category, subcategory, second_subcategory, saved_by, \
     favourites_count, followers_count, views_count, created_at";

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub second_subcategory: Option<String>,
    pub search: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    /// Restrict to listings saved by this email
    pub email: Option<String>,
    pub seed: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProductPage {
    pub products: Vec<Product>,
    pub total_pages: i64,
    pub current_page: i64,
    pub total_products: i64,
    /// Echoed so the client can request further pages of the same permutation
    pub seed: String,
}

fn push_filters(builder: &mut QueryBuilder<'_, sqlx::Postgres>, params: &ListParams) {
    builder.push(" WHERE is_active");
    if let Some(category) = &params.category {
        builder.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(subcategory) = &params.subcategory {
        builder
            .push(" AND subcategory = ")
            .push_bind(subcategory.clone());
    }
    if let Some(second) = &params.second_subcategory {
        builder
            .push(" AND second_subcategory = ")
            .push_bind(second.clone());
    }
    if let Some(search) = &params.search {
        builder
            .push(" AND title ILIKE ")
            .push_bind(format!("%{}%", search));
    }
    if let Some(min) = params.min_price {
        builder.push(" AND price_cents >= ").push_bind(min);
    }
    if let Some(max) = params.max_price {
        builder.push(" AND price_cents <= ").push_bind(max);
    }
    if let Some(email) = &params.email {
        builder.push(" AND saved_by = ").push_bind(email.clone());
    }
}

/// Listing with globally consistent seeded shuffle: the full matching id set
/// is permuted before pagination, so page N+1 of the same seed never repeats
/// or drops rows.
pub async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ProductPage>> {
    let page = params.page.unwrap_or(1).max(1);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let seed = params
        .seed
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(generate_seed);

    let mut id_query = QueryBuilder::new("SELECT id FROM products");
    push_filters(&mut id_query, &params);
    // Stable pre-shuffle order makes the permutation a pure function of the
    // seed and the matching set
    id_query.push(" ORDER BY created_at DESC, id");

    let ids: Vec<(Uuid,)> = id_query.build_query_as().fetch_all(&state.pool).await?;
    let mut ids: Vec<Uuid> = ids.into_iter().map(|(id,)| id).collect();

    let total_products = ids.len() as i64;
    let total_pages = (total_products + limit - 1) / limit;

    shuffle_seeded(&mut ids, &seed);

    let start = ((page - 1) * limit) as usize;
    let page_ids: Vec<Uuid> = ids.into_iter().skip(start).take(limit as usize).collect();

    let mut products: Vec<Product> = if page_ids.is_empty() {
        vec![]
    } else {
        sqlx::query_as(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ANY($1)"
        ))
        .bind(&page_ids)
        .fetch_all(&state.pool)
        .await?
    };

    // Restore the permutation order lost by ANY()
    products.sort_by_key(|p| page_ids.iter().position(|id| *id == p.id));

    Ok(Json(ProductPage {
        products,
        total_pages,
        current_page: page,
        total_products,
        seed,
    }))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> ApiResult<Json<Product>> {
    let product: Option<Product> = sqlx::query_as(&format!(
        "SELECT {PRODUCT_COLUMNS} FROM products WHERE product_id = $1 AND is_active"
    ))
    .bind(&external_id)
    .fetch_optional(&state.pool)
    .await?;

    product.map(Json).ok_or(ApiError::NotFound("product"))
}

#[derive(Debug, Deserialize)]
pub struct ProductPayload {
    pub product_id: String,
    pub title: String,
    #[serde(default)]
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub source_url: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub second_subcategory: Option<String>,
}

pub async fn create_product(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<ProductPayload>,
) -> ApiResult<Json<Product>> {
    if payload.title.trim().is_empty() || payload.product_id.trim().is_empty() {
        return Err(ApiError::Validation(
            "product_id and title are required".to_string(),
        ));
    }
    if payload.price_cents < 0 {
        return Err(ApiError::Validation("price cannot be negative".to_string()));
    }

    let product: Product = sqlx::query_as(&format!(
        r#"
        INSERT INTO products (product_id, title, price_cents, image_url, source_url,
                              category, subcategory, second_subcategory, saved_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (product_id) DO UPDATE
            SET is_active = TRUE, updated_at = NOW()
        RETURNING {PRODUCT_COLUMNS}
        "#
    ))
    .bind(payload.product_id.trim())
    .bind(payload.title.trim())
    .bind(payload.price_cents)
    .bind(&payload.image_url)
    .bind(&payload.source_url)
    .bind(&payload.category)
    .bind(&payload.subcategory)
    .bind(&payload.second_subcategory)
    .bind(&user.email)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(product))
}

pub async fn update_product(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(external_id): Path<String>,
    Json(payload): Json<ProductPayload>,
) -> ApiResult<Json<Product>> {
    // Owners edit their own listings; admins edit anything
    let product: Option<Product> = sqlx::query_as(&format!(
        r#"
        UPDATE products
        SET title = $1, price_cents = $2, image_url = $3, source_url = $4,
            category = $5, subcategory = $6, second_subcategory = $7, updated_at = NOW()
        WHERE product_id = $8 AND is_active AND (saved_by = $9 OR $10)
        RETURNING {PRODUCT_COLUMNS}
        "#
    ))
    .bind(payload.title.trim())
    .bind(payload.price_cents)
    .bind(&payload.image_url)
    .bind(&payload.source_url)
    .bind(&payload.category)
    .bind(&payload.subcategory)
    .bind(&payload.second_subcategory)
    .bind(&external_id)
    .bind(&user.email)
    .bind(user.is_admin())
    .fetch_optional(&state.pool)
    .await?;

    product.map(Json).ok_or(ApiError::NotFound("product"))
}

/// Soft delete: the row stays for interaction history, every read filters it
/// out.
pub async fn delete_product(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(external_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let updated = sqlx::query(
        r#"
        UPDATE products SET is_active = FALSE, updated_at = NOW()
        WHERE product_id = $1 AND is_active AND (saved_by = $2 OR $3)
        "#,
    )
    .bind(&external_id)
    .bind(&user.email)
    .bind(user.is_admin())
    .execute(&state.pool)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound("product"));
    }
    Ok(Json(json!({ "deleted": true })))
}

fn counter_column(kind: &str) -> Option<&'static str> {
    match kind {
        "favourite" => Some("favourites_count"),
        "follower" => Some("followers_count"),
        "view" => Some("views_count"),
        // Blocks are tracked but not counted on the product row
        "blocked" => None,
        _ => None,
    }
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub active: bool,
    pub count: Option<i32>,
}

/// Atomic insert-or-delete toggle with counter maintenance in the same
/// transaction. The UNIQUE constraint makes concurrent double-toggles safe;
/// counters are floored at zero.
pub async fn toggle_interaction(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((external_id, kind)): Path<(String, String)>,
) -> ApiResult<Json<ToggleResponse>> {
    if !matches!(kind.as_str(), "favourite" | "follower" | "view" | "blocked") {
        return Err(ApiError::Validation(format!(
            "unknown interaction kind '{kind}'"
        )));
    }

    let mut tx = state.pool.begin().await?;

    let product: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM products WHERE product_id = $1 AND is_active FOR UPDATE")
            .bind(&external_id)
            .fetch_optional(&mut *tx)
            .await?;
    let (product_id,) = product.ok_or(ApiError::NotFound("product"))?;

    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO product_interactions (product_id, kind, email)
        VALUES ($1, $2, $3)
        ON CONFLICT (product_id, kind, email) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(product_id)
    .bind(&kind)
    .bind(&user.email)
    .fetch_optional(&mut *tx)
    .await?;

    let active = inserted.is_some();
    if !active {
        sqlx::query("DELETE FROM product_interactions WHERE product_id = $1 AND kind = $2 AND email = $3")
            .bind(product_id)
            .bind(&kind)
            .bind(&user.email)
            .execute(&mut *tx)
            .await?;
    }

    let count = match counter_column(&kind) {
        Some(column) => {
            let delta = if active { 1 } else { -1 };
            let (count,): (i32,) = sqlx::query_as(&format!(
                r#"
                UPDATE products
                SET {column} = GREATEST({column} + $1, 0), updated_at = NOW()
                WHERE id = $2
                RETURNING {column}
                "#
            ))
            .bind(delta)
            .bind(product_id)
            .fetch_one(&mut *tx)
            .await?;
            Some(count)
        }
        None => None,
    };

    tx.commit().await?;

    Ok(Json(ToggleResponse { active, count }))
}

#[derive(Debug, Deserialize)]
pub struct VendorEntry {
    pub image_url: String,
    pub source_url: String,
}

/// Replace the ordered alternate-seller list. Position 0 is the listing's
/// own image/link, maintained here like any other entry.
pub async fn set_vendors(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(external_id): Path<String>,
    Json(vendors): Json<Vec<VendorEntry>>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = state.pool.begin().await?;

    let product: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM products WHERE product_id = $1 AND is_active AND (saved_by = $2 OR $3)",
    )
    .bind(&external_id)
    .bind(&user.email)
    .bind(user.is_admin())
    .fetch_optional(&mut *tx)
    .await?;
    let (product_id,) = product.ok_or(ApiError::NotFound("product"))?;

    sqlx::query("DELETE FROM product_vendors WHERE product_id = $1")
        .bind(product_id)
        .execute(&mut *tx)
        .await?;

    for (position, vendor) in vendors.iter().enumerate() {
        sqlx::query(
            "INSERT INTO product_vendors (product_id, position, image_url, source_url) VALUES ($1, $2, $3, $4)",
        )
        .bind(product_id)
        .bind(position as i32)
        .bind(&vendor.image_url)
        .bind(&vendor.source_url)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(Json(json!({ "vendors": vendors.len() })))
}

#[derive(Debug, Deserialize)]
pub struct SaveListingRequest {
    pub product_id: String,
}

/// Save a geo-listing to the user's collection. This is the metered path:
/// the quota charge and the insert share one transaction, so a rejection
/// leaves no trace and a success can't lose the decrement.
pub async fn save_listing(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<SaveListingRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = state.pool.begin().await?;

    let product: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM products WHERE product_id = $1 AND is_active")
            .bind(&payload.product_id)
            .fetch_optional(&mut *tx)
            .await?;
    let (product_id,) = product.ok_or(ApiError::NotFound("product"))?;

    let already: Option<(i32,)> = sqlx::query_as(
        "SELECT position FROM saved_products WHERE user_id = $1 AND product_id = $2",
    )
    .bind(user.user_id)
    .bind(product_id)
    .fetch_optional(&mut *tx)
    .await?;
    if already.is_some() {
        // Re-saving is free and idempotent
        return Ok(Json(json!({ "saved": true })));
    }

    let decision = charge_quota(&mut tx, user.user_id, user.role, MeteredAction::SaveGeoListing)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO saved_products (user_id, product_id, position)
        VALUES ($1, $2, COALESCE(
            (SELECT MAX(position) + 1 FROM saved_products WHERE user_id = $1), 0))
        "#,
    )
    .bind(user.user_id)
    .bind(product_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(user_id = %user.user_id, product = %payload.product_id, decision = ?decision, "listing saved");
    Ok(Json(json!({ "saved": true })))
}

pub async fn list_saved(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Product>>> {
    let products: Vec<Product> = sqlx::query_as(&format!(
        r#"
        SELECT {PRODUCT_COLUMNS} FROM products p
        JOIN saved_products sp ON sp.product_id = p.id
        WHERE sp.user_id = $1 AND p.is_active
        ORDER BY sp.position
        "#
    ))
    .bind(user.user_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(products))
}

/// Removing a saved listing never refunds the quota charge.
pub async fn unsave_listing(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(external_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = sqlx::query(
        r#"
        DELETE FROM saved_products sp
        USING products p
        WHERE sp.product_id = p.id AND sp.user_id = $1 AND p.product_id = $2
        "#,
    )
    .bind(user.user_id)
    .bind(&external_id)
    .execute(&state.pool)
    .await?;

    if deleted.rows_affected() == 0 {
        return Err(ApiError::NotFound("saved product"));
    }
    Ok(Json(json!({ "removed": true })))
}

/// Meter one AI-assisted search. The search itself runs client-side against
/// an external index; this endpoint is the charge.
pub async fn charge_search(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let decision =
        charge_quota_standalone(&state.pool, user.user_id, user.role, MeteredAction::AiSearch)
            .await?;
    Ok(Json(json!({ "charged": true, "decision": format!("{decision:?}") })))
}
