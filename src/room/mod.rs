#![forbid(unsafe_code)]

// Room module - room state, registry, and event fan-out
pub mod api;
pub mod signal;

use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Language tag assigned to freshly created rooms.
pub const DEFAULT_LANGUAGE: &str = "python";

/// Room identifiers are the first 12 hex chars of a v4 UUID (48 bits).
const ROOM_ID_LEN: usize = 12;

/// A live connection subscribed to a room.
pub struct Member {
    pub name: String,
    pub sender: mpsc::Sender<Arc<String>>,
}

/// Per-room shared state.
///
/// `members` is the delivery set (connection id -> outbound channel);
/// `participants` is the join-ordered roster of unique display names. The two
/// can disagree briefly around disconnect races; the roster is authoritative
/// for listings, the member set for delivery.
pub struct Room {
    pub id: String,
    pub members: HashMap<String, Member>,
    pub participants: Vec<String>,
    pub buffer: String,
    pub language: String,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            members: HashMap::new(),
            participants: Vec::new(),
            buffer: String::new(),
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }

    /// Appends `name` to the roster unless it is already present, returning
    /// the up-to-date roster either way.
    pub fn add_participant(&mut self, name: &str) -> Vec<String> {
        if !self.participants.iter().any(|p| p == name) {
            self.participants.push(name.to_string());
        }
        self.participants.clone()
    }

    /// Removes `name` from the roster. No-op when absent.
    pub fn remove_participant(&mut self, name: &str) {
        self.participants.retain(|p| p != name);
    }

    /// Queue a pre-serialized frame on one member's channel. Delivery is
    /// best-effort: a full or closed channel drops the frame for that member
    /// only and never blocks the triggering event.
    fn push_frame(&self, conn_id: &str, member: &Member, json: Arc<String>) {
        match member.sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for connection {} in room {}, dropping frame", conn_id, self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for connection {} in room {} (disconnected)", conn_id, self.id);
            }
        }
    }

    /// Broadcast a message to every member of the room.
    fn broadcast_all(&self, message: &ServerMessage) {
        let Some(json) = encode(message) else { return };
        for (conn_id, member) in &self.members {
            self.push_frame(conn_id, member, json.clone());
        }
    }

    /// Broadcast a message to every member except the sender's connection.
    fn broadcast_except(&self, sender_conn: &str, message: &ServerMessage) {
        let Some(json) = encode(message) else { return };
        for (conn_id, member) in &self.members {
            if conn_id != sender_conn {
                self.push_frame(conn_id, member, json.clone());
            }
        }
    }

    /// Send a message to a single connection.
    fn send_to(&self, conn_id: &str, message: &ServerMessage) {
        let Some(json) = encode(message) else { return };
        if let Some(member) = self.members.get(conn_id) {
            self.push_frame(conn_id, member, json);
        }
    }

    /// Send a message to every connection currently bound to `name`,
    /// returning how many were reached.
    fn send_to_name(&self, name: &str, message: &ServerMessage) -> usize {
        let Some(json) = encode(message) else { return 0 };
        let mut delivered = 0;
        for (conn_id, member) in &self.members {
            if member.name == name {
                self.push_frame(conn_id, member, json.clone());
                delivered += 1;
            }
        }
        delivered
    }
}

fn encode(message: &ServerMessage) -> Option<Arc<String>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize outbound message: {}", e);
            None
        }
    }
}

/// Owns every live room.
///
/// Two-level locking: the outer map lock is a std RwLock held only for brief
/// lookups and inserts, never across await points; each room has its own
/// tokio RwLock held across the read-modify-broadcast sequence for that room
/// only. Mutations to one room are mutually exclusive, so a stale snapshot is
/// never delivered after a later one; cross-room operations share no lock.
///
/// Rooms are never removed once created - they live for the process lifetime,
/// so the map grows with every `create_room` (see DESIGN.md).
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Creates a room with a fresh identifier and returns it. Never fails.
    pub fn create_room(&self) -> String {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        loop {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(ROOM_ID_LEN);
            if rooms.contains_key(&id) {
                continue;
            }
            rooms.insert(id.clone(), Arc::new(TokioRwLock::new(Room::new(id.clone()))));
            self.metrics.inc_rooms_created();
            info!("Created room {}", id);
            return id;
        }
    }

    /// Looks up a room. Absence is a signal, not an error.
    pub fn get_room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.contains_key(room_id)
    }

    /// Adds `username` to a room's roster without subscribing a connection
    /// (HTTP membership pre-registration). Returns the updated roster, or
    /// `None` for an unknown room.
    pub async fn register_participant(&self, room_id: &str, username: &str) -> Option<Vec<String>> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        let participants = room.add_participant(username);
        debug!("{} pre-registered in room {}", username, room_id);
        Some(participants)
    }

    /// Current roster of a room, or `None` for an unknown room.
    pub async fn participants(&self, room_id: &str) -> Option<Vec<String>> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Some(room.participants.clone())
    }

    /// Subscribes a connection to a room: roster entry (idempotent), member
    /// entry, current state to the joiner, join notice to everyone else.
    ///
    /// Returns false when the room does not exist; the event is dropped and
    /// the caller must not record a binding.
    pub async fn join(
        &self,
        room_id: &str,
        conn_id: &str,
        username: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            warn!("Join for unknown room {} by {}, dropping", room_id, username);
            self.metrics.inc_events_dropped();
            return false;
        };
        let mut room = room_lock.write().await;
        let participants = room.add_participant(username);
        room.members.insert(
            conn_id.to_string(),
            Member { name: username.to_string(), sender },
        );
        room.send_to(conn_id, &ServerMessage::InitialState {
            code: room.buffer.clone(),
            language: room.language.clone(),
            participants,
        });
        room.broadcast_except(conn_id, &ServerMessage::UserJoined {
            username: username.to_string(),
        });
        self.metrics.inc_joins();
        info!("{} joined room {} ({} connections)", username, room_id, room.members.len());
        true
    }

    /// Removes a connection and its display name from a room. No-op for an
    /// unknown room or absent name; disconnect races are expected, not errors.
    pub async fn leave(&self, room_id: &str, conn_id: &str, username: &str) {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("Leave for unknown room {}, nothing to do", room_id);
            return;
        };
        let mut room = room_lock.write().await;
        room.remove_participant(username);
        // The leaving connection observes its own removal: broadcast before
        // the member entry is dropped.
        room.broadcast_all(&ServerMessage::UserLeft {
            username: username.to_string(),
        });
        room.members.remove(conn_id);
        self.metrics.inc_leaves();
        info!("{} left room {} ({} connections remain)", username, room_id, room.members.len());
    }

    /// Replaces the shared buffer (last write wins; concurrent edits from two
    /// members silently overwrite each other) and notifies everyone except
    /// the editor.
    pub async fn update_buffer(&self, room_id: &str, conn_id: &str, username: &str, code: String) {
        let Some(room_lock) = self.get_room(room_id) else {
            warn!("Code change for unknown room {} by {}, dropping", room_id, username);
            self.metrics.inc_events_dropped();
            return;
        };
        let mut room = room_lock.write().await;
        room.buffer = code;
        room.broadcast_except(conn_id, &ServerMessage::CodeUpdated {
            code: room.buffer.clone(),
            username: username.to_string(),
        });
        debug!("Buffer updated in room {} by {}", room_id, username);
    }

    /// Replaces the language tag, same full-replace semantics as the buffer.
    pub async fn update_language(&self, room_id: &str, conn_id: &str, username: &str, language: String) {
        let Some(room_lock) = self.get_room(room_id) else {
            warn!("Language change for unknown room {} by {}, dropping", room_id, username);
            self.metrics.inc_events_dropped();
            return;
        };
        let mut room = room_lock.write().await;
        room.language = language;
        room.broadcast_except(conn_id, &ServerMessage::LanguageUpdated {
            language: room.language.clone(),
            username: username.to_string(),
        });
        debug!("Language updated in room {} to {} by {}", room_id, room.language, username);
    }

    /// Broadcasts a chat message to the whole room, sender included. No
    /// existence precondition: an unknown room simply has nobody listening.
    pub async fn chat(&self, room_id: &str, username: &str, message: String) {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("Chat for unknown room {}, nobody to deliver to", room_id);
            return;
        };
        let room = room_lock.read().await;
        room.broadcast_all(&ServerMessage::NewMessage {
            username: username.to_string(),
            message,
        });
        self.metrics.inc_chat_messages();
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total roster entries across all rooms. Rooms whose lock is held by a
    /// writer are skipped rather than waited on.
    pub fn total_participant_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        room_locks
            .iter()
            .filter_map(|lock| lock.try_read().ok())
            .map(|room| room.participants.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(ServerMetrics::new())
    }

    fn member_channel() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(16)
    }

    fn try_next(rx: &mut mpsc::Receiver<Arc<String>>) -> Option<ServerMessage> {
        rx.try_recv()
            .ok()
            .map(|json| serde_json::from_str(&json).expect("valid frame"))
    }

    #[test]
    fn test_create_room_id_shape() {
        let registry = registry();
        let id = registry.create_room();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(registry.room_exists(&id));
        assert!(!registry.room_exists("000000000000"));
    }

    #[test]
    fn test_create_room_ids_unique() {
        let registry = registry();
        let a = registry.create_room();
        let b = registry.create_room();
        assert_ne!(a, b);
        assert_eq!(registry.room_count(), 2);
    }

    #[tokio::test]
    async fn test_add_participant_idempotent() {
        let registry = registry();
        let room_id = registry.create_room();

        let first = registry.register_participant(&room_id, "alice").await.unwrap();
        assert_eq!(first, vec!["alice"]);

        // Re-registering the same name must not duplicate it.
        let second = registry.register_participant(&room_id, "alice").await.unwrap();
        assert_eq!(second, vec!["alice"]);

        let third = registry.register_participant(&room_id, "bob").await.unwrap();
        assert_eq!(third, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_register_participant_unknown_room() {
        let registry = registry();
        assert!(registry.register_participant("missing", "alice").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_participant_twice_is_noop() {
        let registry = registry();
        let room_id = registry.create_room();
        registry.register_participant(&room_id, "alice").await.unwrap();
        registry.register_participant(&room_id, "bob").await.unwrap();

        let room_lock = registry.get_room(&room_id).unwrap();
        {
            let mut room = room_lock.write().await;
            room.remove_participant("alice");
            room.remove_participant("alice");
        }
        assert_eq!(registry.participants(&room_id).await.unwrap(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_join_unknown_room_is_dropped() {
        let registry = registry();
        let (tx, mut rx) = member_channel();
        assert!(!registry.join("missing", "c1", "alice", tx).await);
        assert!(try_next(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_join_sends_state_and_notifies_others() {
        let registry = registry();
        let room_id = registry.create_room();

        let (alice_tx, mut alice_rx) = member_channel();
        assert!(registry.join(&room_id, "c-alice", "alice", alice_tx).await);

        match try_next(&mut alice_rx) {
            Some(ServerMessage::InitialState { code, language, participants }) => {
                assert_eq!(code, "");
                assert_eq!(language, "python");
                assert_eq!(participants, vec!["alice"]);
            }
            other => panic!("expected initialState, got {:?}", other),
        }

        let (bob_tx, mut bob_rx) = member_channel();
        assert!(registry.join(&room_id, "c-bob", "bob", bob_tx).await);

        match try_next(&mut bob_rx) {
            Some(ServerMessage::InitialState { participants, .. }) => {
                assert_eq!(participants, vec!["alice", "bob"]);
            }
            other => panic!("expected initialState, got {:?}", other),
        }
        match try_next(&mut alice_rx) {
            Some(ServerMessage::UserJoined { username }) => assert_eq!(username, "bob"),
            other => panic!("expected userJoined, got {:?}", other),
        }
        // The joiner does not receive its own join notice.
        assert!(try_next(&mut bob_rx).is_none());
    }

    #[tokio::test]
    async fn test_code_change_read_your_writes() {
        let registry = registry();
        let room_id = registry.create_room();

        let (alice_tx, mut alice_rx) = member_channel();
        let (bob_tx, mut bob_rx) = member_channel();
        registry.join(&room_id, "c-alice", "alice", alice_tx).await;
        registry.join(&room_id, "c-bob", "bob", bob_tx).await;
        while try_next(&mut alice_rx).is_some() {}
        while try_next(&mut bob_rx).is_some() {}

        registry.update_buffer(&room_id, "c-alice", "alice", "print(1)".to_string()).await;

        match try_next(&mut bob_rx) {
            Some(ServerMessage::CodeUpdated { code, username }) => {
                assert_eq!(code, "print(1)");
                assert_eq!(username, "alice");
            }
            other => panic!("expected codeUpdated, got {:?}", other),
        }
        // The editor receives nothing back.
        assert!(try_next(&mut alice_rx).is_none());

        // A later join observes the written buffer.
        let (carol_tx, mut carol_rx) = member_channel();
        registry.join(&room_id, "c-carol", "carol", carol_tx).await;
        match try_next(&mut carol_rx) {
            Some(ServerMessage::InitialState { code, .. }) => assert_eq!(code, "print(1)"),
            other => panic!("expected initialState, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_buffer_last_write_wins() {
        let registry = registry();
        let room_id = registry.create_room();
        let (alice_tx, _alice_rx) = member_channel();
        let (bob_tx, _bob_rx) = member_channel();
        registry.join(&room_id, "c-alice", "alice", alice_tx).await;
        registry.join(&room_id, "c-bob", "bob", bob_tx).await;

        registry.update_buffer(&room_id, "c-alice", "alice", "a".to_string()).await;
        registry.update_buffer(&room_id, "c-bob", "bob", "b".to_string()).await;

        let room_lock = registry.get_room(&room_id).unwrap();
        assert_eq!(room_lock.read().await.buffer, "b");
    }

    #[tokio::test]
    async fn test_language_change_skips_sender() {
        let registry = registry();
        let room_id = registry.create_room();
        let (alice_tx, mut alice_rx) = member_channel();
        let (bob_tx, mut bob_rx) = member_channel();
        registry.join(&room_id, "c-alice", "alice", alice_tx).await;
        registry.join(&room_id, "c-bob", "bob", bob_tx).await;
        while try_next(&mut alice_rx).is_some() {}
        while try_next(&mut bob_rx).is_some() {}

        registry.update_language(&room_id, "c-bob", "bob", "rust".to_string()).await;

        match try_next(&mut alice_rx) {
            Some(ServerMessage::LanguageUpdated { language, username }) => {
                assert_eq!(language, "rust");
                assert_eq!(username, "bob");
            }
            other => panic!("expected languageUpdated, got {:?}", other),
        }
        assert!(try_next(&mut bob_rx).is_none());
    }

    #[tokio::test]
    async fn test_leave_notifies_everyone_including_leaver() {
        let registry = registry();
        let room_id = registry.create_room();
        let (alice_tx, mut alice_rx) = member_channel();
        let (bob_tx, mut bob_rx) = member_channel();
        registry.join(&room_id, "c-alice", "alice", alice_tx).await;
        registry.join(&room_id, "c-bob", "bob", bob_tx).await;
        while try_next(&mut alice_rx).is_some() {}
        while try_next(&mut bob_rx).is_some() {}

        registry.leave(&room_id, "c-alice", "alice").await;

        match try_next(&mut bob_rx) {
            Some(ServerMessage::UserLeft { username }) => assert_eq!(username, "alice"),
            other => panic!("expected userLeft, got {:?}", other),
        }
        match try_next(&mut alice_rx) {
            Some(ServerMessage::UserLeft { username }) => assert_eq!(username, "alice"),
            other => panic!("expected userLeft, got {:?}", other),
        }
        assert_eq!(registry.participants(&room_id).await.unwrap(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_leave_unknown_room_is_noop() {
        let registry = registry();
        registry.leave("missing", "c1", "alice").await;
    }

    #[tokio::test]
    async fn test_chat_reaches_sender_too() {
        let registry = registry();
        let room_id = registry.create_room();
        let (alice_tx, mut alice_rx) = member_channel();
        let (bob_tx, mut bob_rx) = member_channel();
        registry.join(&room_id, "c-alice", "alice", alice_tx).await;
        registry.join(&room_id, "c-bob", "bob", bob_tx).await;
        while try_next(&mut alice_rx).is_some() {}
        while try_next(&mut bob_rx).is_some() {}

        registry.chat(&room_id, "alice", "hello".to_string()).await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            match try_next(rx) {
                Some(ServerMessage::NewMessage { username, message }) => {
                    assert_eq!(username, "alice");
                    assert_eq!(message, "hello");
                }
                other => panic!("expected newMessage, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_full_session_scenario() {
        let registry = registry();
        let room_id = registry.create_room();

        let (alice_tx, mut alice_rx) = member_channel();
        registry.join(&room_id, "c-alice", "alice", alice_tx).await;
        match try_next(&mut alice_rx) {
            Some(ServerMessage::InitialState { code, language, participants }) => {
                assert_eq!((code.as_str(), language.as_str()), ("", "python"));
                assert_eq!(participants, vec!["alice"]);
            }
            other => panic!("expected initialState, got {:?}", other),
        }

        let (bob_tx, mut bob_rx) = member_channel();
        registry.join(&room_id, "c-bob", "bob", bob_tx).await;
        match try_next(&mut bob_rx) {
            Some(ServerMessage::InitialState { participants, .. }) => {
                assert_eq!(participants, vec!["alice", "bob"]);
            }
            other => panic!("expected initialState, got {:?}", other),
        }
        match try_next(&mut alice_rx) {
            Some(ServerMessage::UserJoined { username }) => assert_eq!(username, "bob"),
            other => panic!("expected userJoined, got {:?}", other),
        }

        registry.update_buffer(&room_id, "c-alice", "alice", "print(1)".to_string()).await;
        match try_next(&mut bob_rx) {
            Some(ServerMessage::CodeUpdated { code, username }) => {
                assert_eq!((code.as_str(), username.as_str()), ("print(1)", "alice"));
            }
            other => panic!("expected codeUpdated, got {:?}", other),
        }
        assert!(try_next(&mut alice_rx).is_none());

        registry.leave(&room_id, "c-alice", "alice").await;
        match try_next(&mut bob_rx) {
            Some(ServerMessage::UserLeft { username }) => assert_eq!(username, "alice"),
            other => panic!("expected userLeft, got {:?}", other),
        }
        assert_eq!(registry.participants(&room_id).await.unwrap(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_slow_member_does_not_block_others() {
        let registry = registry();
        let room_id = registry.create_room();

        // A capacity-1 channel that nobody drains.
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        let (bob_tx, mut bob_rx) = member_channel();
        registry.join(&room_id, "c-stuck", "stuck", stuck_tx).await;
        registry.join(&room_id, "c-bob", "bob", bob_tx).await;
        while try_next(&mut bob_rx).is_some() {}

        // Several broadcasts overflow the stuck member's channel; bob still
        // receives every frame.
        for i in 0..4 {
            registry.chat(&room_id, "bob", format!("msg {}", i)).await;
        }
        let mut received = 0;
        while try_next(&mut bob_rx).is_some() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_participant_counts() {
        let registry = registry();
        let a = registry.create_room();
        let b = registry.create_room();
        registry.register_participant(&a, "alice").await.unwrap();
        registry.register_participant(&a, "bob").await.unwrap();
        registry.register_participant(&b, "carol").await.unwrap();
        assert_eq!(registry.room_count(), 2);
        assert_eq!(registry.total_participant_count(), 3);
    }
}
