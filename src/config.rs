use anyhow::{Context, Result};
use clap::Parser;

use crate::auth;

#[derive(Debug, Parser)]
#[command(
    name = "bootstrap-signaling",
    author,
    version,
    about = "Bootstrap, signaling and rendezvous server for browser peers"
)]
pub struct Cli {
    /// Listening port.
    #[arg(long, env = "PORT", default_value_t = 8787)]
    port: u16,

    /// Hex SHA-256 digest of the shared signaling secret; empty disables auth.
    #[arg(long, env = "SIGNAL_TOKEN_SHA256", default_value = "")]
    signal_token_sha256: String,

    /// Per-address message cap per 60 s window.
    #[arg(long, env = "RATE_LIMIT_MESSAGES_PER_MINUTE", default_value_t = 300)]
    rate_limit_messages_per_minute: u32,

    /// Per-address concurrent connection cap.
    #[arg(long, env = "RATE_LIMIT_CONNECTIONS_PER_IP", default_value_t = 12)]
    rate_limit_connections_per_ip: u32,

    /// Signaling URL advertised verbatim by /bootstrap.
    #[arg(
        long,
        env = "PUBLIC_SIGNALING_URL",
        default_value = "wss://example.com/signal"
    )]
    public_signaling_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub token_digest: Option<String>,
    pub messages_per_minute: u32,
    pub connections_per_ip: u32,
    pub public_signaling_url: String,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let token_digest = auth::parse_digest(&cli.signal_token_sha256)
            .context("invalid SIGNAL_TOKEN_SHA256")?;
        Ok(Config {
            port: cli.port,
            token_digest,
            messages_per_minute: cli.rate_limit_messages_per_minute,
            connections_per_ip: cli.rate_limit_connections_per_ip,
            public_signaling_url: cli.public_signaling_url,
        })
    }
}
