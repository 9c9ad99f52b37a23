//! insitu-ps - parameter server
//!
//! Aggregates per-function statistics, counter statistics and anomaly
//! metrics from every analysis daemon and hands back the merged model.
//! Runs until a client sends a quit message or the process is signalled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use insitu_daemon::logging;
use insitu_daemon::PsDaemonConfig;
use insitu_sync::{ModelDocument, NetServer, PsState};
use tracing::info;

/// insitu parameter server
#[derive(Parser)]
#[command(name = "insitu-ps")]
#[command(about = "Parameter server for in-situ anomaly detection", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "INSITU_PS_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, env = "INSITU_PS_LISTEN")]
    listen: Option<SocketAddr>,

    /// Handler worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Model document to load on start
    #[arg(long)]
    model_in: Option<PathBuf>,

    /// Model document to write on shutdown
    #[arg(long)]
    model_out: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "INSITU_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "INSITU_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.json);

    let mut config =
        PsDaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(workers) = cli.workers {
        config.server.workers = workers;
    }
    if cli.model_in.is_some() {
        config.model_in = cli.model_in;
    }
    if cli.model_out.is_some() {
        config.model_out = cli.model_out;
    }

    let state = match &config.model_in {
        Some(path) => {
            let doc = ModelDocument::load_or_default(path)
                .with_context(|| format!("reading model {}", path.display()))?;
            PsState::from_document(doc)?
        }
        None => PsState::new(),
    };

    let server = NetServer::bind(config.server.clone(), Arc::new(state))
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    let state = server.state();

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        logging::shutdown_signal().await;
        handle.shutdown();
    });

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server.local_addr()?,
        workers = config.server.workers,
        "insitu-ps starting"
    );
    server.run().await?;

    if let Some(path) = &config.model_out {
        state
            .to_document()?
            .save(path)
            .with_context(|| format!("writing model {}", path.display()))?;
    }
    info!(requests = state.requests_served(), "insitu-ps stopped");
    Ok(())
}
