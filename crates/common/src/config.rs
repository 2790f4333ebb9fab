use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    MissingEnv(&'static str),

    #[error("invalid value for {key}: {source}")]
    InvalidUrl {
        key: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).ok_or(ConfigError::MissingEnv(key))
}

fn optional_env(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_url(key: &'static str) -> Result<Url, ConfigError> {
    let raw = required_env(key)?;
    Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { key, source })
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Process configuration, assembled from environment variables at startup and
/// passed into each component constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub postgres: PostgresConfig,
    pub rpc: RpcConfig,
    pub archive: ArchiveConfig,
    pub live: LiveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl PipelineConfig {
    /// Loads configuration for offline (backfill) commands.
    /// `DATABASE_URL` and `ETH_RPC_URL` are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            postgres: PostgresConfig::from_env()?,
            rpc: RpcConfig::from_env()?,
            archive: ArchiveConfig::from_env()?,
            live: LiveConfig::from_env()?,
            logging: LoggingConfig::from_env(),
            metrics_port: env_parse("METRICS_PORT", default_metrics_port())?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl PostgresConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: required_env("DATABASE_URL")?,
            pool_size: env_parse("DATABASE_POOL_SIZE", default_pool_size())?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(
        serialize_with = "crate::serde_utils::serialize_url",
        deserialize_with = "crate::serde_utils::deserialize_url"
    )]
    pub url: Url,
    #[serde(default = "default_header_batch_size")]
    pub header_batch_size: usize,
    #[serde(default = "default_balance_batch_size")]
    pub balance_batch_size: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl RpcConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_url("ETH_RPC_URL")?,
            header_batch_size: env_parse("RPC_HEADER_BATCH_SIZE", default_header_batch_size())?,
            balance_batch_size: env_parse("RPC_BALANCE_BATCH_SIZE", default_balance_batch_size())?,
            max_concurrent_batches: env_parse(
                "RPC_MAX_CONCURRENT_BATCHES",
                default_max_concurrent_batches(),
            )?,
            request_timeout_secs: env_parse(
                "RPC_REQUEST_TIMEOUT_SECS",
                default_request_timeout_secs(),
            )?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(
        serialize_with = "crate::serde_utils::serialize_url",
        deserialize_with = "crate::serde_utils::deserialize_url"
    )]
    pub base_url: Url,
}

impl ArchiveConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = match optional_env("BLOCK_ARCHIVE_URL") {
            Some(raw) => Url::parse(&raw)
                .map_err(|source| ConfigError::InvalidUrl { key: "BLOCK_ARCHIVE_URL", source })?,
            None => Url::parse(DEFAULT_BLOCK_ARCHIVE_URL).expect("default archive url"),
        };
        Ok(Self { base_url })
    }
}

/// AWS public blockchain dataset, date-partitioned parquet block archive.
pub const DEFAULT_BLOCK_ARCHIVE_URL: &str =
    "https://aws-public-blockchain.s3.us-east-2.amazonaws.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Websocket endpoint, only required by the live coordinator.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_relay_delay_secs")]
    pub relay_publication_delay_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl LiveConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ws_url: optional_env("ETH_WS_URL"),
            queue_capacity: env_parse("LIVE_QUEUE_CAPACITY", default_queue_capacity())?,
            relay_publication_delay_secs: env_parse(
                "RELAY_PUBLICATION_DELAY_SECS",
                default_relay_delay_secs(),
            )?,
            shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", default_shutdown_grace_secs())?,
            ping_interval_secs: env_parse("WS_PING_INTERVAL_SECS", default_ping_interval_secs())?,
        })
    }

    /// The websocket endpoint is validated lazily so that backfill commands
    /// can run without `ETH_WS_URL`.
    pub fn require_ws_url(&self) -> Result<Url, ConfigError> {
        let raw = self.ws_url.as_deref().ok_or(ConfigError::MissingEnv("ETH_WS_URL"))?;
        Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { key: "ETH_WS_URL", source })
    }

    pub fn relay_publication_delay(&self) -> Duration {
        Duration::from_secs(self.relay_publication_delay_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum LoggingConfig {
    #[default]
    Console,
    File {
        dir_path: String,
        file_name: String,
    },
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        match optional_env("LOG_DIR") {
            Some(dir_path) => LoggingConfig::File { dir_path, file_name: "mevscope.log".into() },
            None => LoggingConfig::Console,
        }
    }
}

fn default_metrics_port() -> u16 {
    9500
}

fn default_pool_size() -> usize {
    20
}

fn default_header_batch_size() -> usize {
    50
}

fn default_balance_batch_size() -> usize {
    10
}

fn default_max_concurrent_batches() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    100
}

fn default_relay_delay_secs() -> u64 {
    600
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    20
}
