#![forbid(unsafe_code)]

use clap::Parser;
use dsync_client::config::{load_config, Cli, Commands};
use dsync_client::Client;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: &Cli, client: &Client) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Status => {
            info!("waiting for the app to join session {}", client.config().session_id);
            client.wait_until_ready().await?;
            let status = client.current_status().await?;
            print_json(&status)?;
        }
        Commands::Invoke { invocation } => {
            let invocation: Value = serde_json::from_str(invocation)
                .map_err(|e| anyhow::anyhow!("invocation is not valid JSON: {e}"))?;
            client.wait_until_ready().await?;
            let result = client.execute(invocation).await?;
            print_json(&result)?;
        }
        Commands::Cleanup => {
            info!("waiting for the app to join session {}", client.config().session_id);
            client.wait_until_connected().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref server) = cli.server {
        config.server = server.clone();
    }
    if let Some(ref session_id) = cli.session_id {
        config.session_id = session_id.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let client = Client::new(config);
    client.connect().await?;

    let outcome = tokio::select! {
        result = run(&cli, &client) => result,
        _ = tokio::signal::ctrl_c() => {
            if let Some(dump) = client.dump_pending_requests(None) {
                eprintln!("{dump}");
            }
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    client.cleanup().await?;
    if let Some(crash) = client.get_pending_crash_and_reset() {
        eprintln!("the app crashed: {crash}");
    }
    outcome
}
