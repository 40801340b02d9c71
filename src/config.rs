use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffConfig;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Base URL of the processing service. Relative download URLs resolve against it.
    pub server_url: String,
    pub user_agent: String,
    pub download_dir: PathBuf,
    pub history_path: PathBuf,

    /// Upper bound on simultaneous end-to-end downloads.
    pub max_concurrent_downloads: usize,
    /// Attempts against the processing endpoint, including the first one.
    pub max_attempts: u32,

    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    #[serde(with = "duration_ms")]
    pub pool_idle_timeout: Duration,

    pub chunk_size: u64,
    /// Capped at `chunk::MAX_CHUNKS`.
    pub max_chunks: usize,
    /// Files at or below this size are always fetched with a single stream.
    pub min_chunked_size: u64,
    pub buffer_size: usize,
    #[serde(with = "duration_ms")]
    pub progress_interval: Duration,
    pub rate_limit_bytes_per_sec: Option<u32>,

    pub backoff: BackoffConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            user_agent: concat!("clipfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            download_dir: PathBuf::from("downloads"),
            history_path: PathBuf::from("history.json"),
            max_concurrent_downloads: 10,
            max_attempts: 3,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(5 * 60),
            chunk_size: 1024 * 1024,
            max_chunks: 8,
            min_chunked_size: 1024 * 1024,
            buffer_size: 64 * 1024,
            progress_interval: Duration::from_millis(100),
            rate_limit_bytes_per_sec: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Builds the shared, long-lived HTTP client. No total timeout is set here because
    /// file transfers may legitimately run for minutes; the processing call applies
    /// `request_timeout` per request.
    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
