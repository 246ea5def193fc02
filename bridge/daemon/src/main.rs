//! flowbridge Engine - Remote Computation Engine Process
//!
//! Hosts an interpreter on a background worker and serves it to editors over
//! the flowbridge socket protocol. Editors select it with the `socket`
//! backend.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:7878)
//! flowbridge-engine
//!
//! # Custom listen address and extra packages
//! flowbridge-engine --listen 0.0.0.0:9000 --extension-package sisl
//!
//! # With config file
//! flowbridge-engine --config /etc/flowbridge/bridge.toml
//!
//! # Verbose logging
//! RUST_LOG=debug flowbridge-engine
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use flowbridge_core::config::{default_config_path, load_config_from_path, ConfigSource};
use flowbridge_core::{CapabilityClient, EmbeddedTransportClient, EngineServer};

/// flowbridge Engine - serves a worker-hosted interpreter over TCP
#[derive(Parser, Debug)]
#[command(name = "flowbridge-engine")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(short = 'L', long, value_name = "ADDR")]
    listen: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "FLOWBRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Runtime distribution directory
    #[arg(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// Extra package installed from the package index (repeatable)
    #[arg(long = "extension-package", value_name = "NAME")]
    extension_packages: Vec<String>,

    /// Session selector
    #[arg(long, value_name = "NAME")]
    session: Option<String>,

    /// Refuse run_code requests
    #[arg(long)]
    no_run_code: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "FLOWBRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "flowbridge_engine={level},flowbridge_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                    _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received ctrl-c, initiating shutdown");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("flowbridge engine starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;

    // CLI arguments win over file and environment
    let mut from_cli = false;
    if let Some(listen) = args.listen {
        config.engine_listen = listen;
        from_cli = true;
    }
    if let Some(dir) = args.runtime_dir {
        config.embedded.runtime_dir = Some(dir);
        from_cli = true;
    }
    if !args.extension_packages.is_empty() {
        config.embedded.extension_packages.extend(args.extension_packages);
        from_cli = true;
    }
    if let Some(session) = args.session {
        config.embedded.session_selector = session;
        from_cli = true;
    }
    if args.no_run_code {
        config.engine.allows_run_code = false;
        from_cli = true;
    }
    if from_cli {
        config.set_source(ConfigSource::Cli);
    }
    info!(source = %config.source(), listen = %config.engine_listen, "Configuration resolved");

    let engine = EmbeddedTransportClient::start(&config.embedded)
        .context("Failed to start interpreter worker")?;
    match engine.wait_ready().await {
        Ok(status) => info!(%status, "Interpreter ready"),
        Err(failure) => {
            anyhow::bail!(
                "Interpreter bootstrap failed at {}: {}",
                failure.phase,
                failure.reason
            );
        }
    }

    let engine: Arc<EmbeddedTransportClient> = Arc::new(engine);
    let server = EngineServer::bind(&config.engine_listen, engine.clone(), config.engine.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", config.engine_listen))?;

    let result = server.serve(shutdown_signal()).await;

    info!("Shutting down...");
    engine.shutdown().await;

    match result {
        Ok(()) => {
            info!("flowbridge engine stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Engine stopped with error");
            Err(e.into())
        }
    }
}
