//! Layered configuration for the daemons.
//!
//! Defaults, then an optional file (TOML, JSON or YAML by extension), then
//! `INSITU_`-prefixed environment variables with `__` between nested keys
//! (`INSITU_SERVER__WORKERS=8`), then command-line flags.

use std::net::SocketAddr;
use std::path::PathBuf;

use insitu_driver::DriverConfig;
use insitu_sync::{ClientConfig, ServerConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Parameter server daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsDaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Model document to seed the global model from
    #[serde(default)]
    pub model_in: Option<PathBuf>,

    /// Where to write the global model on shutdown
    #[serde(default)]
    pub model_out: Option<PathBuf>,
}

/// Analysis daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdDaemonConfig {
    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub client: ClientConfig,

    /// Parameter server address; local-only analysis when unset
    #[serde(default)]
    pub ps_addr: Option<SocketAddr>,

    /// JSON-lines trace of this rank
    #[serde(default)]
    pub trace: Option<PathBuf>,

    /// Keep polling the trace for new steps until an end line
    #[serde(default)]
    pub follow: bool,

    /// JSON-lines provenance output
    #[serde(default)]
    pub provenance_out: Option<PathBuf>,

    /// Record batches queued for the provenance writer
    #[serde(default = "default_provenance_queue")]
    pub provenance_queue: usize,
}

impl Default for AdDaemonConfig {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            client: ClientConfig::default(),
            ps_addr: None,
            trace: None,
            follow: false,
            provenance_out: None,
            provenance_queue: default_provenance_queue(),
        }
    }
}

fn default_provenance_queue() -> usize {
    256
}

impl PsDaemonConfig {
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        load_layered(path)
    }
}

impl AdDaemonConfig {
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        load_layered(path)
    }

    /// Client identity follows the driver's program and rank.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            pid: self.driver.program,
            rank: self.driver.rank,
            ..self.client.clone()
        }
    }
}

fn load_layered<T>(path: Option<&str>) -> Result<T, config::ConfigError>
where
    T: Default + Serialize + DeserializeOwned,
{
    let mut builder = config::Config::builder();

    builder = builder.add_source(config::Config::try_from(&T::default())?);

    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("INSITU")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
