//! WebSocket endpoint for the chat relay
//!
//! `GET /api/chat/ws?token=<jwt>` — browsers cannot set an Authorization
//! header on a WebSocket upgrade, so the token rides a query parameter.
//! After the upgrade a client must `attach_session` before any other frame
//! is honored; attachment is authorized against the session row (owner or
//! admin).

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use valora_shared::models::{ChatMessage, ChatSender, UserRole};

use crate::{
    auth::AuthUser,
    chat::{ClientFrame, ServerFrame},
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: String,
}

pub async fn chat_ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let claims = state.jwt_manager.validate(&params.token)?;
    let user = AuthUser {
        user_id: claims.sub,
        email: claims.email,
        role: claims.role,
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

/// Check that the connected user may act on the session: admins always,
/// users only on their own sessions. The session must exist and be active.
async fn authorize_session(pool: &PgPool, user: &AuthUser, session_id: Uuid) -> ApiResult<()> {
    if user.is_admin() {
        let exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM chat_sessions WHERE id = $1 AND status = 'active'")
                .bind(session_id)
                .fetch_optional(pool)
                .await?;
        return exists
            .map(|_| ())
            .ok_or(ApiError::NotFound("chat session"));
    }

    let owned: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM chat_sessions WHERE id = $1 AND user_id = $2 AND status = 'active'",
    )
    .bind(session_id)
    .bind(user.user_id)
    .fetch_optional(pool)
    .await?;
    owned.map(|_| ()).ok_or(ApiError::NotFound("chat session"))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser) {
    let (mut sink, mut stream) = socket.split();
    let mut attached: Option<Uuid> = None;
    let mut forward_task: Option<tokio::task::JoinHandle<()>> = None;

    // Frames for the sink task
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<ServerFrame>(32);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "unparseable chat frame dropped");
                continue;
            }
        };

        match frame {
            ClientFrame::AttachSession { session_id } => {
                if authorize_session(&state.pool, &user, session_id)
                    .await
                    .is_err()
                {
                    tracing::debug!(session_id = %session_id, user_id = %user.user_id, "chat attach refused");
                    continue;
                }

                // Re-attaching moves the connection to the new room
                if let Some(task) = forward_task.take() {
                    task.abort();
                }
                attached = Some(session_id);

                let mut room_rx = state.chat.subscribe(session_id).await;
                let forward_tx = out_tx.clone();
                forward_task = Some(tokio::spawn(async move {
                    while let Ok(frame) = room_rx.recv().await {
                        if forward_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            ClientFrame::SendMessage { session_id, body } => {
                if attached != Some(session_id) || body.trim().is_empty() {
                    continue;
                }
                match persist_message(&state.pool, &user, session_id, &body).await {
                    Ok(message) => {
                        state
                            .chat
                            .publish(session_id, ServerFrame::ReceiveMessage { message })
                            .await;
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, session_id = %session_id, "failed to persist chat message");
                    }
                }
            }
            ClientFrame::AdminRead { session_id } => {
                if attached != Some(session_id) || !user.is_admin() {
                    continue;
                }
                if let Err(err) =
                    mark_read(&state.pool, session_id, UserRole::Admin).await
                {
                    tracing::error!(error = ?err, "failed to mark messages read");
                    continue;
                }
                state
                    .chat
                    .publish(
                        session_id,
                        ServerFrame::MessagesRead {
                            session_id,
                            by: "admin".to_string(),
                        },
                    )
                    .await;
            }
            ClientFrame::UserRead { session_id } => {
                if attached != Some(session_id) {
                    continue;
                }
                if let Err(err) = mark_read(&state.pool, session_id, UserRole::User).await {
                    tracing::error!(error = ?err, "failed to mark messages read");
                    continue;
                }
                state
                    .chat
                    .publish(
                        session_id,
                        ServerFrame::MessagesRead {
                            session_id,
                            by: "user".to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    if let Some(task) = forward_task {
        task.abort();
    }
    writer.abort();
    if let Some(session_id) = attached {
        state.chat.garbage_collect(session_id).await;
    }
}

async fn persist_message(
    pool: &PgPool,
    user: &AuthUser,
    session_id: Uuid,
    body: &str,
) -> ApiResult<ChatMessage> {
    let sender = if user.is_admin() {
        ChatSender::Admin
    } else {
        ChatSender::User
    };

    // The author's own side starts read
    let message: ChatMessage = sqlx::query_as(
        r#"
        INSERT INTO chat_messages (session_id, sender, body, is_read_by_admin, is_read_by_user)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, session_id, sender, body, is_read_by_admin, is_read_by_user, created_at
        "#,
    )
    .bind(session_id)
    .bind(sender.as_str())
    .bind(body)
    .bind(sender == ChatSender::Admin)
    .bind(sender == ChatSender::User)
    .fetch_one(pool)
    .await?;

    sqlx::query("UPDATE chat_sessions SET updated_at = NOW() WHERE id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;

    Ok(message)
}

/// Flip the reader's flag on every counterpart message in the session.
async fn mark_read(pool: &PgPool, session_id: Uuid, reader: UserRole) -> ApiResult<()> {
    let (flag, counterpart) = match reader {
        UserRole::Admin => ("is_read_by_admin", "user"),
        UserRole::User => ("is_read_by_user", "admin"),
    };

    sqlx::query(&format!(
        "UPDATE chat_messages SET {flag} = TRUE WHERE session_id = $1 AND sender = $2"
    ))
    .bind(session_id)
    .bind(counterpart)
    .execute(pool)
    .await?;

    Ok(())
}
