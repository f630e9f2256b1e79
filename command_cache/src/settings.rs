//! Layered configuration: embedded defaults, optional files, environment variables.

use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Defaults shipped with the binary.
const DEFAULTS: &str = include_str!("../config.toml");

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long a request waits for its result before answering 504.
    /// The resolution itself keeps running.
    pub request_timeout_seconds: u64,
    /// Grace period for in-flight requests after SIGINT/SIGTERM.
    pub shutdown_timeout_seconds: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 10,
            shutdown_timeout_seconds: 5,
            max_body_bytes: 1_048_576,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// Result store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: String, // "file" or "memory"
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            path: PathBuf::from("db.json"),
        }
    }
}

/// Simulated executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub result_length: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            result_length: 32,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "text" or "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, `cmdcache.toml` in the working
    /// directory, an explicit config file and `CMDCACHE__*` environment
    /// variables, in increasing order of precedence.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .add_source(File::with_name("cmdcache").required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("CMDCACHE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(anyhow!("Request body limit cannot be 0"));
        }
        if self.server.request_timeout_seconds == 0 {
            return Err(anyhow!("Request timeout cannot be 0"));
        }
        if self.server.shutdown_timeout_seconds == 0 {
            return Err(anyhow!("Shutdown timeout cannot be 0"));
        }

        match self.store.backend.as_str() {
            "file" => {
                if self.store.path.as_os_str().is_empty() {
                    return Err(anyhow!("File store requires a path"));
                }
            }
            "memory" => {}
            other => return Err(anyhow!("Unknown store backend '{}'", other)),
        }

        if self.executor.min_delay_ms > self.executor.max_delay_ms {
            return Err(anyhow!(
                "Executor min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.executor.min_delay_ms,
                self.executor.max_delay_ms
            ));
        }
        if self.executor.result_length == 0 {
            return Err(anyhow!("Executor result length cannot be 0"));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!("Unknown log format '{}'", self.logging.format));
        }

        Ok(())
    }
}
