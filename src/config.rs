// src/config.rs

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on the size of a single artifact (4 GiB).
pub const MAX_DOWNLOAD_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default whole-request timeout for a probe, a chunk or a single stream.
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 10 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Process-wide settings. Every field has a default; `from_env` overlays
/// `ODM_*` environment variables on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub max_download_size: u64,
    pub max_concurrent_tasks: usize,
    pub threads_per_task: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub chunk_retries: u32,
    pub retry_delay_ms: u64,
    pub progress_interval_ms: u64,
    pub artifact_extension: String,
    pub user_agent: String,
    /// Host suffixes a download URL must match. Empty allows any host.
    pub allowed_host_suffixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_download_size: MAX_DOWNLOAD_SIZE,
            max_concurrent_tasks: 2,
            threads_per_task: 4,
            request_timeout_secs: DOWNLOAD_TIMEOUT_SECS,
            connect_timeout_secs: 30,
            chunk_retries: 3,
            retry_delay_ms: 1000,
            progress_interval_ms: 500,
            artifact_extension: "ipa".to_string(),
            user_agent: concat!("odm/", env!("CARGO_PKG_VERSION")).to_string(),
            allowed_host_suffixes: Vec::new(),
        }
    }
}

impl Config {
    /// Builds a config from defaults and `ODM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = lookup("ODM_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup("ODM_BIND_ADDR") {
            config.bind_addr = parse("ODM_BIND_ADDR", &addr)?;
        }
        if let Some(size) = lookup("ODM_MAX_DOWNLOAD_SIZE") {
            config.max_download_size = parse("ODM_MAX_DOWNLOAD_SIZE", &size)?;
        }
        if let Some(n) = lookup("ODM_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse("ODM_MAX_CONCURRENT_TASKS", &n)?;
        }
        if let Some(n) = lookup("ODM_THREADS_PER_TASK") {
            config.threads_per_task = parse("ODM_THREADS_PER_TASK", &n)?;
        }
        if let Some(secs) = lookup("ODM_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse("ODM_REQUEST_TIMEOUT_SECS", &secs)?;
        }
        if let Some(n) = lookup("ODM_CHUNK_RETRIES") {
            config.chunk_retries = parse("ODM_CHUNK_RETRIES", &n)?;
        }
        if let Some(hosts) = lookup("ODM_ALLOWED_HOST_SUFFIXES") {
            config.allowed_host_suffixes = hosts
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if config.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ODM_MAX_CONCURRENT_TASKS",
                value: "0".into(),
            });
        }
        config.threads_per_task = config.threads_per_task.max(1);
        config.chunk_retries = config.chunk_retries.max(1);

        Ok(config)
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tasks.db")
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_download_size: self.max_download_size,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            chunk_retries: self.chunk_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            packages_dir: self.packages_dir(),
            max_concurrent_tasks: self.max_concurrent_tasks,
            threads_per_task: self.threads_per_task,
            max_download_size: self.max_download_size,
            artifact_extension: self.artifact_extension.clone(),
            allowed_host_suffixes: self.allowed_host_suffixes.clone(),
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Settings for one engine instance, shared by all of its runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_download_size: u64,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub chunk_retries: u32,
    pub retry_delay: Duration,
    pub progress_interval: Duration,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Config::default().engine()
    }
}

/// Settings for the task manager and its worker pool.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub packages_dir: PathBuf,
    pub max_concurrent_tasks: usize,
    pub threads_per_task: usize,
    pub max_download_size: u64,
    pub artifact_extension: String,
    pub allowed_host_suffixes: Vec<String>,
}
