//! HTTP route definitions

pub mod auth;
pub mod billing;
pub mod categories;
pub mod chat;
pub mod plans;
pub mod products;
pub mod users;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::auth::middleware::{require_admin, require_auth};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/plans", get(plans::list_plans))
        .route("/api/token-plans", get(plans::list_token_plans))
        .route("/api/products", get(products::list_products))
        .route("/api/products/{id}", get(products::get_product))
        .route("/api/categories", get(categories::get_tree))
        .route("/api/webhooks/stripe", post(billing::stripe_webhook))
        .route("/api/webhooks/paypal", post(billing::paypal_webhook))
        .route("/api/chat/ws", get(crate::chat::ws::chat_ws_handler))
        // Guest chat: no account, the session id is the access capability
        .route("/api/chat/guest-sessions", post(chat::create_guest_session))
        .route(
            "/api/chat/guest-sessions/{id}/messages",
            get(chat::guest_list_messages),
        )
        .route(
            "/api/chat/guest-sessions/{id}/messages",
            post(chat::guest_send_message),
        )
        .route(
            "/api/chat/guest-sessions/{id}/end",
            post(chat::guest_end_session),
        );

    let authed = Router::new()
        .route("/api/users/me", get(users::me))
        .route("/api/billing/checkout", post(billing::stripe_checkout))
        .route(
            "/api/billing/paypal/checkout",
            post(billing::paypal_checkout),
        )
        .route("/api/billing/cancel", post(billing::cancel_subscription))
        .route("/api/billing/subscription", get(billing::subscription_status))
        .route("/api/products", post(products::create_product))
        .route("/api/products/{id}", put(products::update_product))
        .route("/api/products/{id}", delete(products::delete_product))
        .route(
            "/api/products/{id}/toggle/{kind}",
            post(products::toggle_interaction),
        )
        .route("/api/products/{id}/vendors", put(products::set_vendors))
        .route("/api/saved-products", get(products::list_saved))
        .route("/api/saved-products", post(products::save_listing))
        .route("/api/saved-products/{id}", delete(products::unsave_listing))
        .route("/api/search/charge", post(products::charge_search))
        .route("/api/categories", post(categories::create_category))
        .route("/api/subcategories", post(categories::create_subcategory))
        .route(
            "/api/second-subcategories",
            post(categories::create_second_subcategory),
        )
        .route("/api/chat/sessions", post(chat::create_session))
        .route("/api/chat/sessions", get(chat::list_sessions))
        .route(
            "/api/chat/sessions/{id}/messages",
            get(chat::list_messages),
        )
        .route("/api/chat/sessions/{id}/end", post(chat::end_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    let admin = Router::new()
        .route("/api/admin/plans", post(plans::create_plan))
        .route("/api/admin/plans/{id}", put(plans::update_plan))
        .route("/api/admin/plans/{id}", delete(plans::delete_plan))
        .route("/api/admin/token-plans", post(plans::create_token_plan))
        .route(
            "/api/admin/token-plans/{id}",
            delete(plans::delete_token_plan),
        )
        .route("/api/admin/users", get(users::list_users))
        .route("/api/admin/users/{id}/tokens", put(users::set_tokens))
        .route(
            "/api/admin/billing/invariants",
            get(billing::run_invariants),
        )
        .route(
            "/api/admin/categories/{id}",
            delete(categories::delete_category),
        )
        .route("/api/admin/chat/sessions/{id}", delete(chat::delete_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    public.merge(authed).merge(admin).with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
