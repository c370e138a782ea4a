//! Server configuration

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3847;

#[derive(Parser, Debug, Clone)]
#[command(name = "handoff")]
#[command(about = "Hands agent deliveries to a human reviewer and collects feedback")]
pub struct ServerConfig {
    /// Interface to bind
    #[arg(long, env = "HANDOFF_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "HANDOFF_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding index.json and deliveries/
    #[arg(long, env = "HANDOFF_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Default project name for delivery metadata
    #[arg(long, env = "HANDOFF_PROJECT_NAME")]
    pub project_name: Option<String>,

    /// How long to wait for a record lock before failing
    #[arg(long, env = "HANDOFF_LOCK_TIMEOUT_MS", default_value_t = 5000)]
    pub lock_timeout_ms: u64,

    /// Base URL used in delivery links, if different from host:port
    #[arg(long, env = "HANDOFF_PUBLIC_URL")]
    pub public_url: Option<String>,
}

impl ServerConfig {
    /// Config for a data directory with every other knob at its default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            data_dir: data_dir.into(),
            project_name: None,
            lock_timeout_ms: 5000,
            public_url: None,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn project_name(&self) -> String {
        self.project_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(crate::metadata::default_project_name)
    }

    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Reviewer-facing link to a delivery
    pub fn delivery_url(&self, id: &str) -> String {
        format!("{}/deliveries/{}", self.public_url(), id)
    }
}
