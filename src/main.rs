use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zonelimit::config::{LoggingConfig, ServiceConfig};
use zonelimit::http::HttpServer;
use zonelimit::ratelimit::{RateLimiter, RulesConfig};

/// Leaky-bucket rate limiting sidecar.
#[derive(Debug, Parser)]
#[command(name = "zonelimit", version, about)]
struct Cli {
    /// Service configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rules document, overrides `rate_limiting.rules_path`
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Listen address, overrides `server.listen_addr`
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref())
        .context("Failed to load service configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(rules) = cli.rules {
        config.rate_limiting.rules_path = Some(rules);
    }

    init_tracing(&config.logging)?;

    info!("Starting Zonelimit Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules_path = config
        .rate_limiting
        .rules_path
        .clone()
        .context("No rules file configured (use --rules or rate_limiting.rules_path)")?;
    let rules = RulesConfig::from_file(&rules_path)
        .with_context(|| format!("Failed to load rules from {}", rules_path.display()))?;

    let rate_limiter = Arc::new(RateLimiter::new(&rules)?);
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    #[cfg(unix)]
    spawn_reload_on_hangup(Arc::clone(&rate_limiter), rules_path)?;

    let server = HttpServer::new(config.server.listen_addr, rate_limiter);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Zonelimit Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("Invalid log level \"{}\"", logging.level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Reload the rules document on SIGHUP. A document that fails to load
/// leaves the running rules in place.
#[cfg(unix)]
fn spawn_reload_on_hangup(rate_limiter: Arc<RateLimiter>, rules_path: PathBuf) -> anyhow::Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(path = %rules_path.display(), "Received SIGHUP, reloading rules");
            let reloaded = RulesConfig::from_file(&rules_path)
                .and_then(|rules| rate_limiter.reload(&rules));
            if let Err(e) = reloaded {
                error!(error = %e, "Rules reload failed, keeping current rules");
            }
        }
    });
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
