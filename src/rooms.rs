//! Live room membership and best-effort fan-out.
//!
//! Fan-out never blocks on a slow consumer: a full outbound queue drops the
//! frame for that member only, a closed queue evicts the member.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Depth of each member's bounded outbound queue.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

pub const DEFAULT_NAMESPACE: &str = "global";
pub const DEFAULT_ROOM: &str = "public";

/// Composite `(namespace, room)` map key, rendered as `"{namespace}::{room}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub namespace: String,
    pub room: String,
}

impl RoomKey {
    /// Build a key, defaulting absent or empty components.
    pub fn new(namespace: Option<String>, room: Option<String>) -> Self {
        Self {
            namespace: namespace
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            room: room
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_ROOM.to_string()),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.room)
    }
}

/// A live peer session as seen by the hub.
pub struct RoomMember {
    pub session_id: u64,
    pub peer_id: String,
    pub client_address: String,
    pub connected_at: u64,
    pub sender: mpsc::Sender<Message>,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session id, so teardown of a superseded session cannot
/// remove its replacement from the room.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FanoutStats {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<RoomHubInner>,
}

struct RoomHubInner {
    rooms: DashMap<RoomKey, HashMap<String, RoomMember>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RoomHubInner {
                rooms: DashMap::new(),
            }),
        }
    }

    /// Insert a member, replacing any existing member with the same peer id.
    pub fn join(&self, key: &RoomKey, member: RoomMember) {
        let mut room = self.inner.rooms.entry(key.clone()).or_default();
        room.insert(member.peer_id.clone(), member);
    }

    /// Remove the member for `peer_id` only if it still belongs to
    /// `session_id`. Empty rooms are collapsed.
    pub fn leave(&self, key: &RoomKey, peer_id: &str, session_id: u64) -> bool {
        let mut removed = false;
        if let Some(mut room) = self.inner.rooms.get_mut(key) {
            if room
                .get(peer_id)
                .map(|m| m.session_id == session_id)
                .unwrap_or(false)
            {
                room.remove(peer_id);
                removed = true;
            }
        }
        self.inner.rooms.remove_if(key, |_, room| room.is_empty());
        removed
    }

    pub fn member_count(&self, key: &RoomKey) -> usize {
        self.inner.rooms.get(key).map(|room| room.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn total_members(&self) -> usize {
        self.inner.rooms.iter().map(|room| room.len()).sum()
    }

    /// Enqueue `text` to every member of the room except the sender.
    pub fn fanout(&self, key: &RoomKey, sender_peer_id: &str, text: &str) -> FanoutStats {
        let mut stats = FanoutStats::default();

        // Clone the send handles first; try_send happens without the shard
        // guard held.
        let targets: Vec<(String, u64, mpsc::Sender<Message>)> = match self.inner.rooms.get(key) {
            Some(room) => room
                .values()
                .filter(|member| member.peer_id != sender_peer_id)
                .map(|member| {
                    (
                        member.peer_id.clone(),
                        member.session_id,
                        member.sender.clone(),
                    )
                })
                .collect(),
            None => return stats,
        };

        let mut closed = Vec::new();
        for (peer_id, session_id, sender) in targets {
            match sender.try_send(Message::Text(text.to_string())) {
                Ok(()) => stats.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => stats.dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stats.closed += 1;
                    closed.push((peer_id, session_id));
                }
            }
        }
        for (peer_id, session_id) in closed {
            self.leave(key, &peer_id, session_id);
        }

        stats
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}
