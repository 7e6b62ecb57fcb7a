use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

use crate::state::{
    RelaySettings, DEFAULT_HISTORY_LIMIT, DEFAULT_OUTBOUND_BUFFER, DEFAULT_SESSION_TTL_SECS,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    /// Keep everything in process memory instead of Redis.
    pub ephemeral: bool,
    pub relay: RelaySettings,
    pub shutdown_grace: Duration,
    pub log_filter: Option<String>,
    pub otel_stdout: bool,
}

#[derive(Debug, Parser)]
#[command(
    name = "flare-server",
    author,
    version,
    about = "Real-time chat relay with priority distress alerts"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "FLARE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: String,

    /// Redis connection URI for message history, alerts and accounts.
    #[arg(long, env = "FLARE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Use the in-memory store (development only; nothing survives a restart).
    #[arg(long, env = "FLARE_EPHEMERAL", default_value_t = false)]
    ephemeral: bool,

    /// Number of recent messages replayed to each new connection.
    #[arg(long, env = "FLARE_HISTORY_LIMIT", default_value_t = DEFAULT_HISTORY_LIMIT)]
    history_limit: usize,

    /// Live messages a connection may fall behind by before it is dropped.
    /// Its queue additionally reserves room for the history replay.
    #[arg(long, env = "FLARE_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    outbound_buffer: usize,

    /// Lifetime of login session tokens.
    #[arg(long, env = "FLARE_SESSION_TTL_SECS", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    session_ttl_secs: i64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "FLARE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,

    /// Tracing filter directives; falls back to RUST_LOG, then `info`.
    #[arg(long, env = "FLARE_LOG_FILTER")]
    log_filter: Option<String>,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, env = "FLARE_OTEL_STDOUT", default_value_t = false)]
    otel_stdout: bool,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one message");
        }
        if cli.session_ttl_secs <= 0 {
            bail!("session ttl must be positive, got {}", cli.session_ttl_secs);
        }
        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url,
            ephemeral: cli.ephemeral,
            relay: RelaySettings {
                history_limit: cli.history_limit,
                outbound_buffer: cli.outbound_buffer,
                session_ttl: time::Duration::seconds(cli.session_ttl_secs),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            log_filter: cli.log_filter,
            otel_stdout: cli.otel_stdout,
        })
    }
}
