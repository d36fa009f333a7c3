//! request-guard server.
//!
//! ```text
//!   client ──▶ request id ─▶ trace ─▶ ┌──────────── pipeline ────────────┐ ─▶ timeout ─▶ handler
//!                                     │ rate_limit → csrf                │
//!   client ◀───────────────────────── │ rate_limit → csrf → sanitize →   │ ◀───────────────┘
//!                                     │ security_headers                 │
//!                                     └──────────────────────────────────┘
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use request_guard::config::{config_warnings, load_config, GuardConfig};
use request_guard::lifecycle::{shutdown_signal, Shutdown};
use request_guard::observability::{init_logging, init_metrics};
use request_guard::GuardServer;

#[derive(Parser)]
#[command(name = "request-guard")]
#[command(about = "CSRF, rate limiting, sanitization and security headers for HTTP apps", long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GuardConfig::default(),
    };

    init_logging(&config.observability).context("initializing logging")?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "request-guard starting");
    for warning in config_warnings(&config) {
        tracing::warn!("{}", warning);
    }

    tracing::info!(
        bind_address = %config.server.bind_address,
        request_timeout_secs = config.server.request_timeout_secs,
        csp_directives = config.csp.directives.len(),
        endpoint_rules = config.rate_limit.per_endpoint.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr = config
            .observability
            .metrics_address
            .parse()
            .context("parsing metrics address")?;
        init_metrics(addr).context("starting metrics exporter")?;
    }

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = GuardServer::new(config).context("building request pipeline")?;

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.trigger();
    });

    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
