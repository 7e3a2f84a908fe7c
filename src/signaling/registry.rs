#![forbid(unsafe_code)]

// Connection registry - maps live connections to their current room binding.
// A connection is bound to at most one (room, name) pair at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct ConnectionEntry {
    room_id: Option<String>,
    username: Option<String>,
}

/// Shared map of live connections and their room bindings.
///
/// Disconnect cleanup depends on this map: `on_disconnect` hands back the
/// final binding so the caller can run the equivalent of a leave, which is
/// what keeps ghost participants out of room rosters after abrupt drops.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<StdRwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdRwLock::new(HashMap::new())),
        }
    }

    /// Registers a new connection with no binding and returns its id.
    pub fn on_connect(&self) -> String {
        let conn_id = Uuid::new_v4().to_string();
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(conn_id.clone(), ConnectionEntry::default());
        debug!("Registered connection {}", conn_id);
        conn_id
    }

    /// Records the connection's room and display name after a successful
    /// join. Overwrites any previous binding; callers leave the old room
    /// first (rebind is leave-then-join).
    pub fn bind(&self, conn_id: &str, room_id: &str, username: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(conn_id.to_string()).or_default();
        entry.room_id = Some(room_id.to_string());
        entry.username = Some(username.to_string());
    }

    /// Clears the connection's binding, returning what was bound.
    pub fn unbind(&self, conn_id: &str) -> Option<(String, String)> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.get_mut(conn_id)?;
        Some((entry.room_id.take()?, entry.username.take()?))
    }

    /// Current binding of a connection, if any.
    pub fn binding(&self, conn_id: &str) -> Option<(String, String)> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let entry = map.get(conn_id)?;
        Some((entry.room_id.clone()?, entry.username.clone()?))
    }

    /// Removes the connection entirely, returning its last binding so the
    /// caller can perform leave cleanup.
    pub fn on_disconnect(&self, conn_id: &str) -> Option<(String, String)> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.remove(conn_id)?;
        debug!("Removed connection {}", conn_id);
        Some((entry.room_id?, entry.username?))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
