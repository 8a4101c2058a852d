//! `transit-relay` binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use transit_relay::api::{self, AppState};
use transit_relay::config::{LogConfig, LogFormat, ProxyConfig};
use transit_relay::health::{start_periodic_usage_flush, RelayMetrics, USAGE_FLUSH_INTERVAL};
use transit_relay::upstream::HttpUpstream;

const DEFAULT_LOG_FILTER: &str = "transit_relay=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(name = "transit-relay")]
#[command(about = "Caching, coalescing proxy for a rate-limited transit API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "TRANSIT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the proxy (default)
    Serve,
    /// Print the effective configuration with the credential redacted
    Config,
}

impl Cli {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal; real env vars still apply.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config =
        ProxyConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
        Command::Serve => run(config).await,
    }
}

async fn run(config: ProxyConfig) -> Result<()> {
    init_tracing(&config.log);
    config.validate().context("invalid configuration")?;
    info!(
        upstream = %config.upstream.base_url,
        resources = config.resources.len(),
        default_retry_after_secs = config.default_retry_after_secs,
        "Starting transit relay"
    );

    let upstream = Arc::new(
        HttpUpstream::new(&config.upstream).context("failed to build upstream client")?,
    );
    let metrics = Arc::new(RelayMetrics::new());
    let state = AppState::from_config(&config, upstream, Arc::clone(&metrics));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let flush = start_periodic_usage_flush(metrics, USAGE_FLUSH_INTERVAL, shutdown_rx);

    let served = api::start_server(&config, state, shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = flush.await {
        warn!(error = %e, "Usage flush task ended abnormally");
    }
    served.context("server error")
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match log.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    if let Err(e) = installed {
        eprintln!("tracing already initialized: {e}");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                ctrl_c.await;
                info!("Received Ctrl+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::parse_from(["transit-relay"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::parse_from([
            "transit-relay",
            "serve",
            "--bind",
            "0.0.0.0",
            "--port",
            "9000",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.command, Some(Command::Serve));

        let mut config = ProxyConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_cli_config_subcommand() {
        let cli = Cli::parse_from(["transit-relay", "config", "--config", "relay.json"]);
        assert_eq!(cli.command, Some(Command::Config));
        assert_eq!(cli.config, Some(PathBuf::from("relay.json")));
    }
}
