//! insitu-ad - per-rank analysis daemon
//!
//! Reads one rank's JSON-lines trace step by step, reconstructs calls,
//! flags outliers, writes provenance and syncs with the parameter server.
//! Prints the run report as JSON on completion.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use insitu_daemon::logging;
use insitu_daemon::AdDaemonConfig;
use insitu_driver::{Driver, JsonLinesSink, JsonLinesSource, ProvenanceWriter};
use insitu_sync::PsClient;
use tracing::info;

/// insitu analysis daemon
#[derive(Parser)]
#[command(name = "insitu-ad")]
#[command(about = "Per-rank in-situ anomaly detection", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "INSITU_AD_CONFIG")]
    config: Option<String>,

    /// JSON-lines trace to analyse
    #[arg(short, long)]
    trace: Option<PathBuf>,

    /// Keep polling the trace until an end line
    #[arg(long)]
    follow: bool,

    /// Parameter server address
    #[arg(long, env = "INSITU_PS_ADDR")]
    ps: Option<SocketAddr>,

    /// Rank id
    #[arg(long)]
    rank: Option<u32>,

    /// Program id
    #[arg(long)]
    program: Option<u32>,

    /// Outlier threshold in standard deviations
    #[arg(long)]
    sigma: Option<f64>,

    /// Samples per function before calls can be flagged
    #[arg(long)]
    min_samples: Option<u64>,

    /// Sync with the parameter server every N steps
    #[arg(long)]
    sync_every: Option<u64>,

    /// JSON-lines provenance output
    #[arg(long)]
    provenance_out: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "INSITU_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "INSITU_LOG_JSON")]
    json: bool,
}

impl Cli {
    fn apply(self, config: &mut AdDaemonConfig) {
        if self.trace.is_some() {
            config.trace = self.trace;
        }
        if self.follow {
            config.follow = true;
        }
        if self.ps.is_some() {
            config.ps_addr = self.ps;
        }
        if let Some(rank) = self.rank {
            config.driver.rank = rank;
        }
        if let Some(program) = self.program {
            config.driver.program = program;
        }
        if let Some(sigma) = self.sigma {
            config.driver.detector.sigma = sigma;
        }
        if let Some(min_samples) = self.min_samples {
            config.driver.detector.min_samples = min_samples;
        }
        if let Some(sync_every) = self.sync_every {
            config.driver.sync_every_steps = sync_every;
        }
        if self.provenance_out.is_some() {
            config.provenance_out = self.provenance_out;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.json);

    let mut config =
        AdDaemonConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);

    let trace = config
        .trace
        .clone()
        .context("no trace given (--trace or `trace` in the config file)")?;
    let source = JsonLinesSource::open(&trace)
        .await
        .with_context(|| format!("opening trace {}", trace.display()))?
        .following(config.follow);

    let mut driver = Driver::new(config.driver.clone(), source)?;

    if let Some(addr) = config.ps_addr {
        let client = PsClient::connect(addr, config.client_config())
            .await
            .with_context(|| format!("connecting to parameter server {addr}"))?;
        driver = driver.with_client(client);
    }

    if let Some(path) = &config.provenance_out {
        let sink = JsonLinesSink::create(path)
            .with_context(|| format!("opening provenance output {}", path.display()))?;
        driver = driver.with_provenance(ProvenanceWriter::new(sink, config.provenance_queue)?);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        trace = %trace.display(),
        rank = config.driver.rank,
        "insitu-ad starting"
    );
    let report = driver.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
