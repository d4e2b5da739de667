use std::sync::Arc;

use tokio::sync::watch;

use crate::auth::TokenVerifier;
use crate::clock::Clock;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::rendezvous::RendezvousRegistry;
use crate::rooms::RoomHub;

/// Collaborator bundle shared by the HTTP and signaling layers. Everything
/// here is constructed once at startup; nothing reaches through globals.
pub struct AppState {
    pub config: Config,
    pub clock: Clock,
    pub metrics: Metrics,
    pub verifier: TokenVerifier,
    pub limiter: RateLimiter,
    pub rendezvous: RendezvousRegistry,
    pub hub: RoomHub,
    /// Flips to true when the process starts shutting down; every live
    /// session watches it and closes promptly.
    pub shutdown: watch::Sender<bool>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Config, clock: Clock) -> Self {
        let verifier = TokenVerifier::new(config.token_digest.clone());
        let limiter = RateLimiter::new(RateLimitConfig {
            connections_per_addr: config.connections_per_ip,
            messages_per_window: config.messages_per_minute,
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            clock,
            metrics: Metrics::new(),
            verifier,
            limiter,
            rendezvous: RendezvousRegistry::new(),
            hub: RoomHub::new(),
            shutdown,
        }
    }
}
