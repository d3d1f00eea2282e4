use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nutri_server::{JwtResolver, ServerConfig};
use nutri_telemetry::TelemetryConfig;
use secrecy::SecretString;

/// Real-time change notification hub for the nutrition practice backend.
#[derive(Debug, Parser)]
#[command(name = "nutri", version)]
struct Cli {
    #[arg(long, env = "NUTRI_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "NUTRI_PORT", default_value_t = 5080)]
    port: u16,

    /// HS256 secret used to validate bearer tokens.
    #[arg(long, env = "NUTRI_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Token claim holding the practitioner id.
    #[arg(long, env = "NUTRI_PRACTITIONER_CLAIM", default_value = nutri_server::config::DEFAULT_PRACTITIONER_CLAIM)]
    practitioner_claim: String,

    #[arg(long, env = "NUTRI_MAX_SEND_QUEUE", default_value_t = 256)]
    max_send_queue: usize,

    #[arg(long, env = "NUTRI_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    #[arg(long, env = "NUTRI_CLIENT_TIMEOUT_SECS", default_value_t = 90)]
    client_timeout_secs: u64,

    #[arg(long, env = "NUTRI_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// Per-module level override such as `nutri_notify=debug`. Repeatable.
    #[arg(
        long = "log-module",
        env = "NUTRI_LOG_MODULES",
        value_delimiter = ',',
        value_parser = nutri_telemetry::parse_module_level
    )]
    log_modules: Vec<(String, tracing::Level)>,

    /// Emit human-readable logs instead of JSON.
    #[arg(long, env = "NUTRI_LOG_TEXT")]
    log_text: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    nutri_telemetry::init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        module_levels: cli.log_modules,
        json: !cli.log_text,
    })
    .context("failed to initialize telemetry")?;

    tracing::info!("starting notification hub");

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        max_send_queue: cli.max_send_queue,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
        client_timeout: Duration::from_secs(cli.client_timeout_secs),
        practitioner_claim: cli.practitioner_claim,
        ..Default::default()
    };
    let resolver = Arc::new(JwtResolver::hs256(&SecretString::from(cli.jwt_secret)));

    let handle = nutri_server::start(config, resolver)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "notification hub ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
