//! Per-source-address admission control: a concurrent-connection counter and
//! a fixed-window message counter, each O(1) per operation.

use dashmap::DashMap;

/// Fixed message accounting window.
pub const MESSAGE_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Max concurrent connections per client address.
    pub connections_per_addr: u32,
    /// Max messages per client address per 60 s window.
    pub messages_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connections_per_addr: 12,
            messages_per_window: 300,
        }
    }
}

struct MessageBucket {
    window_start: u64,
    count: u32,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    connections: DashMap<String, u32>,
    messages: DashMap<String, MessageBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            messages: DashMap::new(),
        }
    }

    /// Admit a new connection from `addr`. On rejection the counter is left
    /// untouched (the increment is rolled back).
    pub fn allow_connection(&self, addr: &str) -> bool {
        let mut entry = self.connections.entry(addr.to_string()).or_insert(0);
        *entry += 1;
        if *entry > self.config.connections_per_addr {
            *entry -= 1;
            let empty = *entry == 0;
            drop(entry);
            if empty {
                self.connections.remove_if(addr, |_, count| *count == 0);
            }
            return false;
        }
        true
    }

    /// Release a previously admitted connection; the entry vanishes at zero.
    pub fn release_connection(&self, addr: &str) {
        if let Some(mut entry) = self.connections.get_mut(addr) {
            *entry = entry.saturating_sub(1);
            let empty = *entry == 0;
            drop(entry);
            if empty {
                self.connections.remove_if(addr, |_, count| *count == 0);
            }
        }
    }

    /// Count one message from `addr` against the current 60 s window.
    pub fn allow_message(&self, addr: &str, now_ms: u64) -> bool {
        let mut bucket = self
            .messages
            .entry(addr.to_string())
            .or_insert(MessageBucket {
                window_start: now_ms,
                count: 0,
            });
        if now_ms >= bucket.window_start + MESSAGE_WINDOW_MS {
            bucket.window_start = now_ms;
            bucket.count = 0;
        }
        bucket.count += 1;
        bucket.count <= self.config.messages_per_window
    }

    /// Current connection count for `addr` (0 when absent).
    pub fn connection_count(&self, addr: &str) -> u32 {
        self.connections.get(addr).map(|c| *c).unwrap_or(0)
    }

    /// Whether any connection entry exists for `addr`.
    pub fn has_connection_entry(&self, addr: &str) -> bool {
        self.connections.contains_key(addr)
    }
}
