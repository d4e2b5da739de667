//! TTL-indexed peer discovery registry, purely in-memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::rooms::RoomKey;

pub const DEFAULT_TTL_MS: u64 = 60_000;
pub const DEFAULT_DISCOVER_LIMIT: usize = 32;
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// A discoverable advertisement of a peer within a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendezvousRecord {
    pub peer_id: String,
    pub namespace: String,
    pub room: String,
    pub addresses: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub seen_at: u64,
    pub expires_at: u64,
}

/// Registry entry plus the owner token of whichever session (or HTTP
/// registration) wrote it. The token never leaves the process; it exists so
/// a superseded session's teardown cannot delete its replacement's record.
struct StoredRecord {
    owner: u64,
    record: RendezvousRecord,
}

#[derive(Clone)]
pub struct RendezvousRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: DashMap<RoomKey, HashMap<String, StoredRecord>>,
}

impl RendezvousRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
            }),
        }
    }

    /// Store (or replace) the record for `peer_id`, marking `owner` as the
    /// only token allowed to remove it. `expires_at` always lands strictly
    /// after `seen_at`; a zero TTL is bumped to one millisecond.
    pub fn register(
        &self,
        key: &RoomKey,
        peer_id: &str,
        addresses: Vec<String>,
        ttl_ms: Option<u64>,
        metadata: serde_json::Map<String, serde_json::Value>,
        owner: u64,
        now: u64,
    ) -> RendezvousRecord {
        let ttl = ttl_ms.unwrap_or(DEFAULT_TTL_MS).max(1);
        let record = RendezvousRecord {
            peer_id: peer_id.to_string(),
            namespace: key.namespace.clone(),
            room: key.room.clone(),
            addresses,
            metadata,
            seen_at: now,
            expires_at: now.saturating_add(ttl),
        };
        self.inner.rooms.entry(key.clone()).or_default().insert(
            peer_id.to_string(),
            StoredRecord {
                owner,
                record: record.clone(),
            },
        );
        record
    }

    /// Live records for a room, freshest first, capped at `limit`.
    pub fn discover(&self, key: &RoomKey, limit: Option<usize>, now: u64) -> Vec<RendezvousRecord> {
        let limit = limit.unwrap_or(DEFAULT_DISCOVER_LIMIT);
        let mut records: Vec<RendezvousRecord> = match self.inner.rooms.get_mut(key) {
            Some(mut room) => {
                room.retain(|_, stored| stored.record.expires_at > now);
                room.values().map(|stored| stored.record.clone()).collect()
            }
            None => return Vec::new(),
        };
        self.inner.rooms.remove_if(key, |_, room| room.is_empty());

        records.sort_by(|a, b| b.seen_at.cmp(&a.seen_at).then(a.peer_id.cmp(&b.peer_id)));
        records.truncate(limit);
        records
    }

    /// Remove the record for `peer_id` only while `owner` still holds it; a
    /// record re-registered by a newer session stays put, the same way
    /// `RoomHub::leave` protects a replacement member. Empty rooms evaporate.
    pub fn remove_peer(&self, key: &RoomKey, peer_id: &str, owner: u64) -> bool {
        let removed = self
            .inner
            .rooms
            .get_mut(key)
            .map(|mut room| {
                if room
                    .get(peer_id)
                    .map(|stored| stored.owner == owner)
                    .unwrap_or(false)
                {
                    room.remove(peer_id);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        self.inner.rooms.remove_if(key, |_, room| room.is_empty());
        removed
    }

    /// Drop every record with `expires_at <= now`; delete emptied rooms.
    pub fn prune_expired(&self, now: u64) -> usize {
        let keys: Vec<RoomKey> = self
            .inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut pruned = 0usize;
        for key in keys {
            if let Some(mut room) = self.inner.rooms.get_mut(&key) {
                let before = room.len();
                room.retain(|_, stored| stored.record.expires_at > now);
                pruned += before - room.len();
            }
            self.inner.rooms.remove_if(&key, |_, room| room.is_empty());
        }
        pruned
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Periodic expiry sweep. The handle is aborted on shutdown; the task
    /// never holds anything that would keep the process alive on its own.
    pub fn spawn_pruner(&self, clock: Clock) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let pruned = registry.prune_expired(clock.now_ms());
                if pruned > 0 {
                    debug!(pruned, "rendezvous.pruned");
                }
            }
        })
    }
}

impl Default for RendezvousRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RoomKey {
        RoomKey::new(Some("n".into()), Some("r".into()))
    }

    fn registry() -> RendezvousRegistry {
        RendezvousRegistry::new()
    }

    #[test]
    fn register_then_discover_roundtrip() {
        let reg = registry();
        let record = reg.register(
            &key(),
            "p1",
            vec!["addr-a".into()],
            None,
            Default::default(),
            1,
            1_000,
        );
        assert_eq!(record.seen_at, 1_000);
        assert_eq!(record.expires_at, 1_000 + DEFAULT_TTL_MS);

        let found = reg.discover(&key(), None, 1_500);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer_id, "p1");
        assert_eq!(found[0].addresses, vec!["addr-a".to_string()]);
    }

    #[test]
    fn reregister_replaces_the_record() {
        let reg = registry();
        reg.register(&key(), "p1", vec![], Some(5_000), Default::default(), 1, 1_000);
        reg.register(&key(), "p1", vec!["new".into()], Some(5_000), Default::default(), 2, 2_000);

        let found = reg.discover(&key(), None, 2_500);
        assert_eq!(found.len(), 1, "re-register must not duplicate");
        assert_eq!(found[0].seen_at, 2_000);
        assert_eq!(found[0].addresses, vec!["new".to_string()]);
    }

    #[test]
    fn discover_sorts_by_seen_at_descending_and_honors_limit() {
        let reg = registry();
        for (peer, at) in [("a", 10), ("b", 30), ("c", 20)] {
            reg.register(&key(), peer, vec![], Some(10_000), Default::default(), 1, at);
        }
        let found = reg.discover(&key(), None, 50);
        let order: Vec<&str> = found.iter().map(|r| r.peer_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);

        let capped = reg.discover(&key(), Some(2), 50);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].peer_id, "b");
    }

    #[test]
    fn discover_prunes_expired_records_first() {
        let reg = registry();
        reg.register(&key(), "stale", vec![], Some(50), Default::default(), 1, 0);
        reg.register(&key(), "fresh", vec![], Some(10_000), Default::default(), 2, 0);

        let found = reg.discover(&key(), None, 100);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer_id, "fresh");
    }

    #[test]
    fn remove_peer_reports_presence_and_collapses_rooms() {
        let reg = registry();
        reg.register(&key(), "p1", vec![], None, Default::default(), 1, 0);
        assert!(reg.remove_peer(&key(), "p1", 1));
        assert!(!reg.remove_peer(&key(), "p1", 1));
        assert_eq!(reg.room_count(), 0);
        assert!(reg.discover(&key(), None, 0).is_empty());
    }

    #[test]
    fn superseded_owner_cannot_remove_replacement() {
        let reg = registry();
        reg.register(&key(), "p1", vec![], Some(10_000), Default::default(), 1, 0);
        // A reconnect with the same peer id takes over the record.
        reg.register(&key(), "p1", vec![], Some(10_000), Default::default(), 2, 5);

        assert!(!reg.remove_peer(&key(), "p1", 1), "stale owner must not remove");
        let found = reg.discover(&key(), None, 10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].seen_at, 5);

        assert!(reg.remove_peer(&key(), "p1", 2));
        assert!(reg.discover(&key(), None, 10).is_empty());
    }

    #[test]
    fn prune_expired_leaves_only_live_records() {
        let reg = registry();
        let other = RoomKey::new(Some("n2".into()), Some("r2".into()));
        reg.register(&key(), "a", vec![], Some(100), Default::default(), 1, 0);
        reg.register(&key(), "b", vec![], Some(500), Default::default(), 2, 0);
        reg.register(&other, "c", vec![], Some(100), Default::default(), 3, 0);

        // expires_at <= now is expired: a record registered at 0 with ttl 100
        // dies exactly at t=100.
        let pruned = reg.prune_expired(100);
        assert_eq!(pruned, 2);
        assert_eq!(reg.room_count(), 1);
        let left = reg.discover(&key(), None, 100);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].peer_id, "b");
        for record in &left {
            assert!(record.expires_at > 100);
        }
    }

    #[test]
    fn zero_ttl_still_expires_after_seen_at() {
        let reg = registry();
        let record = reg.register(&key(), "p", vec![], Some(0), Default::default(), 1, 42);
        assert!(record.expires_at > record.seen_at);
    }

    #[test]
    fn record_serializes_camel_case_without_owner() {
        let reg = registry();
        let mut metadata = serde_json::Map::new();
        metadata.insert("transport".into(), serde_json::json!("websocket"));
        let record = reg.register(&key(), "p1", vec![], Some(1_000), metadata, 9, 7);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["peerId"], "p1");
        assert_eq!(json["seenAt"], 7);
        assert_eq!(json["expiresAt"], 1_007);
        assert_eq!(json["metadata"]["transport"], "websocket");
        assert!(json.get("owner").is_none(), "owner token stays internal");
    }
}
