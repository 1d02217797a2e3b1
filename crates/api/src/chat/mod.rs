//! Support chat relay
//!
//! Rooms are keyed by chat session id; each room is a tokio broadcast
//! channel carrying already-serialized server frames. The hub lives on
//! `AppState`, so there is no process-wide singleton and tests can build
//! isolated instances.

pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use valora_shared::models::ChatMessage;

/// Per-room broadcast capacity. A lagging subscriber drops frames rather
/// than backpressuring the room; the REST history endpoint is the catch-up
/// path.
const ROOM_CAPACITY: usize = 64;

/// Frames pushed to connected room members.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A persisted message, echoed to everyone in the room (sender included).
    ReceiveMessage { message: ChatMessage },
    /// Read receipt: `by` is "admin" or "user".
    MessagesRead { session_id: Uuid, by: String },
    /// The session was ended (by either side or an admin).
    SessionEnded { session_id: Uuid },
}

/// Frames accepted from clients.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join the room for a session. Must precede any other frame.
    AttachSession { session_id: Uuid },
    SendMessage { session_id: Uuid, body: String },
    /// Admin marks the user's messages read.
    AdminRead { session_id: Uuid },
    /// User marks the admin's messages read.
    UserRead { session_id: Uuid },
}

/// Shared chat room registry.
#[derive(Clone)]
pub struct ChatState {
    rooms: Arc<RwLock<HashMap<Uuid, broadcast::Sender<ServerFrame>>>>,
}

impl ChatState {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Join a room, creating it on first attach.
    pub async fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<ServerFrame> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Broadcast a frame to a room. A room with no listeners is a no-op;
    /// messages are persisted before broadcast so nothing is lost.
    pub async fn publish(&self, session_id: Uuid, frame: ServerFrame) {
        let rooms = self.rooms.read().await;
        if let Some(sender) = rooms.get(&session_id) {
            // Err means no active receivers, which is fine
            let _ = sender.send(frame);
        }
    }

    /// Drop a room once its session ended and the last member left.
    pub async fn garbage_collect(&self, session_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(sender) = rooms.get(&session_id) {
            if sender.receiver_count() == 0 {
                rooms.remove(&session_id);
            }
        }
    }
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_room_members() {
        let state = ChatState::new();
        let session = Uuid::new_v4();

        let mut a = state.subscribe(session).await;
        let mut b = state.subscribe(session).await;

        state
            .publish(
                session,
                ServerFrame::MessagesRead {
                    session_id: session,
                    by: "admin".to_string(),
                },
            )
            .await;

        assert!(matches!(a.recv().await, Ok(ServerFrame::MessagesRead { .. })));
        assert!(matches!(b.recv().await, Ok(ServerFrame::MessagesRead { .. })));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let state = ChatState::new();
        let one = Uuid::new_v4();
        let two = Uuid::new_v4();

        let mut listener = state.subscribe(one).await;
        let _other = state.subscribe(two).await;

        state
            .publish(
                two,
                ServerFrame::SessionEnded { session_id: two },
            )
            .await;

        assert!(listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_to_empty_room_is_noop() {
        let state = ChatState::new();
        state
            .publish(
                Uuid::new_v4(),
                ServerFrame::SessionEnded {
                    session_id: Uuid::new_v4(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn test_garbage_collect_removes_idle_room() {
        let state = ChatState::new();
        let session = Uuid::new_v4();

        let rx = state.subscribe(session).await;
        drop(rx);
        state.garbage_collect(session).await;

        assert!(state.rooms.read().await.is_empty());
    }

    #[test]
    fn test_client_frame_decodes() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"send_message","session_id":"c0fccd19-6957-4294-9fb1-67e2a6a3b8c0","body":"hi"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::SendMessage { .. }));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"shutdown"}"#).is_err());
    }
}
