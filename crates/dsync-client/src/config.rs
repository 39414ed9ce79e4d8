use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI interface for the tester client.
#[derive(Parser)]
#[command(name = "dsync-client", about = "Tester client for the dsync session broker")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Broker URL override.
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Session id override.
    #[arg(long, global = true)]
    pub session_id: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Wait for the app to join and become ready, then print its status.
    Status,
    /// Send one invocation (JSON) to the app and print the result.
    Invoke {
        /// Invocation object as JSON text.
        invocation: String,
    },
    /// Wait for the app to join, tell it the run is over, and disconnect.
    Cleanup,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket URL of the session broker.
    pub server: String,
    /// Session shared with the app under test.
    pub session_id: String,
    /// Stall watchdog period in milliseconds; 0 disables it.
    pub debug_synchronization_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "ws://localhost:8099".to_string(),
            session_id: String::new(),
            debug_synchronization_ms: 0,
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.is_empty() {
            return Err("server URL must not be empty".to_string());
        }
        if !(self.server.starts_with("ws://") || self.server.starts_with("wss://")) {
            return Err(format!(
                "server URL must start with ws:// or wss://, got: {}",
                self.server
            ));
        }
        if self.session_id.is_empty() {
            return Err("session_id must not be empty".to_string());
        }
        Ok(())
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("server", defaults.server.as_str())?
        .set_default("session_id", defaults.session_id.as_str())?
        .set_default(
            "debug_synchronization_ms",
            defaults.debug_synchronization_ms as i64,
        )?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        let native_path = dirs::config_dir().map(|d| d.join("dsync").join("config.toml"));
        let xdg_path = dirs::home_dir().map(|d| d.join(".config").join("dsync").join("config.toml"));

        let resolved = native_path
            .filter(|p| p.exists())
            .or_else(|| xdg_path.filter(|p| p.exists()));

        if let Some(config_path) = resolved {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    builder = builder.add_source(config::Environment::with_prefix("DSYNC"));

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}
