//! Chat session REST endpoints
//!
//! The WebSocket relay handles live traffic; these endpoints cover session
//! lifecycle and history catch-up.

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use valora_shared::models::{ChatMessage, ChatSender};

use crate::auth::AuthUser;
use crate::chat::ServerFrame;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub guest_email: Option<String>,
    pub product_id: Option<Uuid>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

const SESSION_COLUMNS: &str =
    "id, user_id, guest_email, product_id, status, created_at, updated_at";

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub product_id: Option<Uuid>,
}

/// Open a session. A user has at most one active session; creating while one
/// is open returns the existing session instead of a second room.
pub async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CreateSessionRequest>,
) -> ApiResult<Json<ChatSession>> {
    let mut tx = state.pool.begin().await?;

    let existing: Option<ChatSession> = sqlx::query_as(&format!(
        "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE user_id = $1 AND status = 'active' FOR UPDATE"
    ))
    .bind(user.user_id)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(session) = existing {
        return Ok(Json(session));
    }

    let session: ChatSession = sqlx::query_as(&format!(
        r#"
        INSERT INTO chat_sessions (user_id, product_id)
        VALUES ($1, $2)
        RETURNING {SESSION_COLUMNS}
        "#
    ))
    .bind(user.user_id)
    .bind(payload.product_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(session = %session.id, user_id = %user.user_id, "chat session opened");
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct GuestSessionRequest {
    pub guest_email: String,
    pub product_id: Option<Uuid>,
}

fn normalize_guest_email(raw: &str) -> ApiResult<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("invalid email".to_string()));
    }
    Ok(email)
}

/// Open a session without an account. Guests are identified by email; the
/// session id itself is the access capability for the other guest endpoints.
/// One active session per guest email; re-posting returns the open session.
pub async fn create_guest_session(
    State(state): State<AppState>,
    Json(payload): Json<GuestSessionRequest>,
) -> ApiResult<Json<ChatSession>> {
    let guest_email = normalize_guest_email(&payload.guest_email)?;

    let mut tx = state.pool.begin().await?;

    let existing: Option<ChatSession> = sqlx::query_as(&format!(
        "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE guest_email = $1 AND status = 'active' FOR UPDATE"
    ))
    .bind(&guest_email)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some(session) = existing {
        return Ok(Json(session));
    }

    let session: ChatSession = sqlx::query_as(&format!(
        r#"
        INSERT INTO chat_sessions (guest_email, product_id)
        VALUES ($1, $2)
        RETURNING {SESSION_COLUMNS}
        "#
    ))
    .bind(&guest_email)
    .bind(payload.product_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(session = %session.id, "guest chat session opened");
    Ok(Json(session))
}

/// Guest endpoints only reach sessions opened without an account; a session
/// bound to a user id is invisible here.
async fn load_guest_session(state: &AppState, session_id: Uuid) -> ApiResult<ChatSession> {
    let session: Option<ChatSession> = sqlx::query_as(&format!(
        "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = $1 AND user_id IS NULL"
    ))
    .bind(session_id)
    .fetch_optional(&state.pool)
    .await?;
    session.ok_or(ApiError::NotFound("chat session"))
}

#[derive(Debug, Deserialize)]
pub struct GuestMessageRequest {
    pub body: String,
}

pub async fn guest_send_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<GuestMessageRequest>,
) -> ApiResult<Json<ChatMessage>> {
    let body = payload.body.trim();
    if body.is_empty() {
        return Err(ApiError::Validation("message body is empty".to_string()));
    }

    let session = load_guest_session(&state, session_id).await?;
    if session.status != "active" {
        return Err(ApiError::Validation("session has ended".to_string()));
    }

    let message: ChatMessage = sqlx::query_as(
        r#"
        INSERT INTO chat_messages (session_id, sender, body, is_read_by_user)
        VALUES ($1, $2, $3, TRUE)
        RETURNING id, session_id, sender, body, is_read_by_admin, is_read_by_user, created_at
        "#,
    )
    .bind(session_id)
    .bind(ChatSender::User.as_str())
    .bind(body)
    .fetch_one(&state.pool)
    .await?;

    sqlx::query("UPDATE chat_sessions SET updated_at = NOW() WHERE id = $1")
        .bind(session_id)
        .execute(&state.pool)
        .await?;

    state
        .chat
        .publish(
            session_id,
            ServerFrame::ReceiveMessage {
                message: message.clone(),
            },
        )
        .await;

    Ok(Json(message))
}

/// History catch-up for a guest session (guests have no socket auth, so
/// they poll this instead of attaching to the room).
pub async fn guest_list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    load_guest_session(&state, session_id).await?;
    load_history(&state, session_id).await.map(Json)
}

pub async fn guest_end_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    load_guest_session(&state, session_id).await?;
    close_session(&state, session_id).await?;
    Ok(Json(json!({ "ended": true })))
}

/// Admin sees all sessions; a user sees only their own.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ChatSession>>> {
    let sessions: Vec<ChatSession> = if user.is_admin() {
        sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions ORDER BY updated_at DESC"
        ))
        .fetch_all(&state.pool)
        .await?
    } else {
        sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE user_id = $1 ORDER BY updated_at DESC"
        ))
        .bind(user.user_id)
        .fetch_all(&state.pool)
        .await?
    };
    Ok(Json(sessions))
}

async fn load_authorized_session(
    state: &AppState,
    user: &AuthUser,
    session_id: Uuid,
) -> ApiResult<ChatSession> {
    let session: Option<ChatSession> = sqlx::query_as(&format!(
        "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = $1"
    ))
    .bind(session_id)
    .fetch_optional(&state.pool)
    .await?;
    let session = session.ok_or(ApiError::NotFound("chat session"))?;

    if !user.is_admin() && session.user_id != Some(user.user_id) {
        return Err(ApiError::NotFound("chat session"));
    }
    Ok(session)
}

async fn load_history(state: &AppState, session_id: Uuid) -> ApiResult<Vec<ChatMessage>> {
    let messages: Vec<ChatMessage> = sqlx::query_as(
        r#"
        SELECT id, session_id, sender, body, is_read_by_admin, is_read_by_user, created_at
        FROM chat_messages
        WHERE session_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(session_id)
    .fetch_all(&state.pool)
    .await?;
    Ok(messages)
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    load_authorized_session(&state, &user, session_id).await?;
    load_history(&state, session_id).await.map(Json)
}

/// Flip the session to ended and leave a system line in the transcript.
/// The system message starts read on both sides so it never counts as
/// unread; attached sockets get it before the closing frame.
async fn close_session(state: &AppState, session_id: Uuid) -> ApiResult<()> {
    let mut tx = state.pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE chat_sessions SET status = 'ended', updated_at = NOW() WHERE id = $1 AND status = 'active'",
    )
    .bind(session_id)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound("chat session"));
    }

    let farewell: ChatMessage = sqlx::query_as(
        r#"
        INSERT INTO chat_messages (session_id, sender, body, is_read_by_admin, is_read_by_user)
        VALUES ($1, $2, 'Chat session ended', TRUE, TRUE)
        RETURNING id, session_id, sender, body, is_read_by_admin, is_read_by_user, created_at
        "#,
    )
    .bind(session_id)
    .bind(ChatSender::System.as_str())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    state
        .chat
        .publish(session_id, ServerFrame::ReceiveMessage { message: farewell })
        .await;
    state
        .chat
        .publish(session_id, ServerFrame::SessionEnded { session_id })
        .await;

    Ok(())
}

pub async fn end_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    load_authorized_session(&state, &user, session_id).await?;
    close_session(&state, session_id).await?;
    Ok(Json(json!({ "ended": true })))
}

/// Hard delete of a session and its messages (admin only; messages cascade).
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
        .bind(session_id)
        .execute(&state.pool)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(ApiError::NotFound("chat session"));
    }

    state
        .chat
        .publish(session_id, ServerFrame::SessionEnded { session_id })
        .await;
    state.chat.garbage_collect(session_id).await;

    Ok(Json(json!({ "deleted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_email_is_normalized() {
        assert_eq!(
            normalize_guest_email("  Guest@Example.COM ").unwrap(),
            "guest@example.com"
        );
    }

    #[test]
    fn test_guest_email_rejects_invalid() {
        assert!(normalize_guest_email("").is_err());
        assert!(normalize_guest_email("   ").is_err());
        assert!(normalize_guest_email("not-an-email").is_err());
    }
}
