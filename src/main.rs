//! Reverse-proxy upstream router.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request        ┌──────────────────────────────────────────────────┐
//!     ──────────────────────┼─▶ net listener ─▶ http server ─▶ load balancer   │
//!                           │                                      │           │
//!                           │                                      ▼           │
//!     Client Response       │                               ┌────────────┐     │
//!     ◀─────────────────────┼── response relay ◀── attempt ─│  registry  │     │
//!                           │          (retry on another)   └─────▲──────┘     │
//!                           │                                     │            │
//!                           │   health prober ── mark(id) ────────┘            │
//!                           │   admin API ────── drain/undrain ───┘            │
//!                           │   config watcher ─ replace ─────────┘            │
//!                           └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use upstream_router::config::{load_config, watcher::ConfigWatcher};
use upstream_router::lifecycle::signals::{Signal, Signals};
use upstream_router::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "upstream-router")]
#[command(about = "HTTP reverse proxy with health-aware upstream routing", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "router.toml")]
    config: PathBuf,

    /// Disable reloading when the config file changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "upstream-router starting");

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstreams = config.upstreams.len(),
        request_timeout_secs = config.timeouts.request_secs,
        max_retries = config.retries.max_retries,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let proxy = upstream_router::start(config).await?;
    tracing::info!(address = %proxy.local_addr(), "Listening for connections");

    let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
    let _watcher = if cli.no_watch {
        None
    } else {
        match watcher.run() {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable, reload with SIGHUP only");
                None
            }
        }
    };

    let mut signals = Signals::new()?;
    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Signal::Shutdown => break,
                Signal::Reload => match load_config(&cli.config) {
                    Ok(next) => apply_reload(&proxy, &next),
                    Err(e) => tracing::error!(error = %e, "Reload failed, keeping current configuration"),
                },
            },
            Some(next) = updates.recv() => apply_reload(&proxy, &next),
        }
    }

    proxy.stop().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn apply_reload(proxy: &upstream_router::RunningProxy, config: &upstream_router::ProxyConfig) {
    match proxy.reload(config) {
        Ok(()) => tracing::info!(upstreams = config.upstreams.len(), "Configuration reloaded"),
        Err(e) => tracing::error!(error = %e, "Reload rejected, keeping current configuration"),
    }
}
