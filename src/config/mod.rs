use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the proxy listens on, e.g. "0.0.0.0:8080".
    pub listen: String,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Ring points generated per unit of backend weight. 0 means the
    /// built-in default (180). Consistent hashing only.
    #[serde(default)]
    pub ketama_points: u32,

    /// How many ring points are tried before giving up on a key. 0 means
    /// the built-in default (2). Consistent hashing only.
    #[serde(default)]
    pub backup_count: u32,

    /// Where the hashing key comes from. Consistent hashing only.
    #[serde(default)]
    pub hash_key: HashKey,

    pub servers: Vec<BackendEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    LeastConn,
    ConsistentHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKey {
    /// Request path and query.
    #[default]
    Uri,
    /// A named request header.
    Header(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    /// "http(s)://host:port"
    pub address: String,

    #[serde(default = "default_weight")]
    pub weight: u8,

    /// Errors tolerated per window before the backend goes offline.
    /// 0 disables health gating for this backend.
    #[serde(default = "default_max_errors")]
    pub max_errors: u64,

    /// Error-accounting window in seconds. 0 disables health gating.
    #[serde(default = "default_errors_window")]
    pub errors_window_secs: u64,
}

fn default_weight() -> u8 {
    1
}

fn default_max_errors() -> u64 {
    1
}

fn default_errors_window() -> u64 {
    10
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen address '{}'", self.listen))?;

        if self.upstream.servers.is_empty() {
            anyhow::bail!("Upstream must have at least one server");
        }

        for entry in &self.upstream.servers {
            crate::upstream::Backend::new(&entry.address, entry.weight)
                .with_context(|| format!("Invalid upstream server '{}'", entry.address))?;
        }

        if let HashKey::Header(name) = &self.upstream.hash_key {
            hyper::header::HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid hash key header '{}'", name))?;
        }

        Ok(())
    }
}
