use clap::Parser;
use std::net::SocketAddr;

/// CLI arguments for the session broker.
#[derive(Parser, Debug, Clone)]
#[command(name = "dsync-server")]
#[command(about = "Session broker pairing testers with apps under test")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8099", env = "DSYNC_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9099", env = "DSYNC_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Disable the metrics endpoint.
    #[arg(long, env = "DSYNC_NO_METRICS")]
    pub no_metrics: bool,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "DSYNC_MAX_CONNS")]
    pub max_conns: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "DSYNC_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "67108864", env = "DSYNC_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint, `None` when disabled.
    pub metrics_addr: Option<SocketAddr>,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
}

/// Upper bound for `max_message_size` (1 GiB).
const MAX_ALLOWED_MESSAGE_SIZE: usize = 1 << 30;

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        // Large payloads (view hierarchies, screenshots) are expected, so only
        // guard the extremes.
        if self.max_message_size < 1024 {
            return Err("max_message_size must be at least 1024 bytes".to_string());
        }
        if self.max_message_size > MAX_ALLOWED_MESSAGE_SIZE {
            return Err(format!(
                "max_message_size exceeds maximum allowed ({MAX_ALLOWED_MESSAGE_SIZE} bytes)"
            ));
        }

        if self.metrics_addr == Some(self.listen) {
            return Err("metrics_addr must differ from listen".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: (!args.no_metrics).then_some(args.metrics_addr),
            max_conns: args.max_conns,
            ping_interval: args.ping_interval,
            max_message_size: args.max_message_size,
        }
    }
}
