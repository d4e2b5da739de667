use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

/// Millisecond time source behind [`Clock`]; swapped out in tests.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Cheaply clonable clock handle. All TTL math and envelope timestamps go
/// through this so registry behavior stays deterministic under test.
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn TimeSource>,
}

impl Clock {
    pub fn system() -> Self {
        Self {
            source: Arc::new(SystemTimeSource),
        }
    }

    pub fn from_source(source: Arc<dyn TimeSource>) -> Self {
        Self { source }
    }

    pub fn now_ms(&self) -> u64 {
        self.source.now_ms()
    }

    /// ISO-8601 UTC with millisecond precision, e.g. `2024-05-01T12:00:00.000Z`.
    pub fn now_iso(&self) -> String {
        let ms = self.now_ms() as i64;
        DateTime::<Utc>::from_timestamp_millis(ms)
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Generate a peer id for clients that did not supply one.
pub fn generate_peer_id(clock: &Clock) -> String {
    let bytes: [u8; 6] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("peer-{}-{}", clock.now_ms(), hex)
}
