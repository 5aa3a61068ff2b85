use std::{env, fs, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result};
use engine_api::PluginConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::logger::LogLevel;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("`{0}` must be at least 1")]
    ZeroCeiling(&'static str),
    #[error("`cleanupIntervalMs` must be greater than 0")]
    ZeroInterval,
    #[error("unsupported config file extension `{0}` (use .json, .yaml or .yml)")]
    UnsupportedFormat(String),
    #[error("invalid {name}={value}: {reason}")]
    InvalidEnv { name: &'static str, value: String, reason: String },
}

/// Limits and housekeeping settings of the manager store.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreOptions {
    /// Tasks one session may run at the same time.
    pub max_concurrent_runs_per_manager: usize,
    /// Tasks all sessions together may run at the same time.
    pub max_concurrent_runs_global: usize,
    /// A session unused for longer than this is evicted.
    pub max_idle_time_ms: u64,
    /// A session older than this is evicted, used or not.
    pub max_life_time_ms: u64,
    /// Delay between an event and the next eviction sweep.
    pub cleanup_interval_ms: u64,
    pub logs_dir: PathBuf,
    pub log_level: LogLevel,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_concurrent_runs_per_manager: 3,
            max_concurrent_runs_global: 10,
            max_idle_time_ms: 10 * 60 * 1000,
            max_life_time_ms: 60 * 60 * 1000,
            cleanup_interval_ms: 60 * 1000,
            logs_dir: PathBuf::from("./logs"),
            log_level: LogLevel::Info,
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_runs_per_manager == 0 {
            return Err(ConfigError::ZeroCeiling("maxConcurrentRunsPerManager"));
        }
        if self.max_concurrent_runs_global == 0 {
            return Err(ConfigError::ZeroCeiling("maxConcurrentRunsGlobal"));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn max_life_time(&self) -> Duration {
        Duration::from_millis(self.max_life_time_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 4321 }
    }
}

/// Everything the `langpong` binary reads at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub manager: StoreOptions,
    pub server: ServerOptions,
    /// Plugin configuration used by `/init` when a request carries none.
    pub plugins_default: Vec<PluginConfig>,
}

/// Where the loaded values came from. Logged once tracing is installed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSources {
    pub file: Option<PathBuf>,
    pub dotenv: Option<PathBuf>,
}

impl ConfigSources {
    pub fn log(&self) {
        match &self.file {
            Some(path) => info!("Loaded config from {}", path.display()),
            None => info!("No config file given, using defaults"),
        }
        if let Some(path) = &self.dotenv {
            info!("Loaded .env from {}", path.display());
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional config file, then the environment.
    /// Command line overrides are applied by the caller afterwards.
    pub fn load(file: Option<&Path>) -> Result<(Self, ConfigSources)> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let dotenv = config.apply_env()?;
        Ok((config, ConfigSources { file: file.map(Path::to_path_buf), dotenv }))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_lowercase();
        let config = match extension.as_str() {
            "json" => serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?,
            "yaml" | "yml" => serde_yaml_bw::from_str(&raw)
                .with_context(|| format!("invalid YAML in {}", path.display()))?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string()).into()),
        };
        Ok(config)
    }

    /// Loads `.env` (if present), then applies the `PORT`, `HOST` and
    /// `LOG_LEVEL` variables. Returns the `.env` file that was read.
    pub fn apply_env(&mut self) -> Result<Option<PathBuf>, ConfigError> {
        let dotenv = dotenvy::dotenv().ok();
        self.apply_vars(|name| env::var(name).ok())?;
        Ok(dotenv)
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(port) = var("PORT") {
            self.server.port = port.parse().map_err(|err: std::num::ParseIntError| ConfigError::InvalidEnv {
                name: "PORT",
                value: port.clone(),
                reason: err.to_string(),
            })?;
        }
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.manager.log_level = level.parse().map_err(|reason| ConfigError::InvalidEnv {
                name: "LOG_LEVEL",
                value: level.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.manager.validate()
    }
}
