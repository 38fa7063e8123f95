//! Layered configuration: defaults, TOML file, then `RUNWATCH__*` environment.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "runwatch";

/// File name of the persisted transcript inside the data directory.
pub const TRANSCRIPT_FILE_NAME: &str = "command_history.log";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub runner: RunnerConfig,
    pub telemetry: TelemetryConfig,
    pub visualizer: VisualizerConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Transcript file. Defaults to `command_history.log` in the data directory.
    pub transcript_path: Option<String>,
    /// Working directory for runs. Defaults to the server's.
    pub working_dir: Option<PathBuf>,
    pub kill_grace_secs: u64,
    pub stop_timeout_secs: u64,
    /// Extra environment variables for runs.
    pub env: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            transcript_path: None,
            working_dir: None,
            kill_grace_secs: 5,
            stop_timeout_secs: 15,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub period_ms: u64,
    /// Delay between the two CPU counter reads of one sample.
    pub cpu_settle_ms: u64,
    /// Samples kept for replay.
    pub capacity: usize,
    /// Mount path whose free space is reported.
    pub disk_path: String,
    /// GPU query tool. Empty disables GPU readings.
    pub gpu_query_binary: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 1000,
            cpu_settle_ms: 1000,
            capacity: crate::telemetry::DEFAULT_CAPACITY,
            disk_path: "/".to_string(),
            gpu_query_binary: "nvidia-smi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    pub binary: String,
    /// Argument template; `{log_dir}`, `{host}` and `{port}` are substituted.
    pub args: Vec<String>,
    pub default_log_dir: String,
    pub default_port: u16,
    pub default_host: String,
    /// Host the proxy connects to.
    pub connect_host: String,
    pub kill_grace_secs: u64,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            binary: "tensorboard".to_string(),
            args: ["--logdir", "{log_dir}", "--host", "{host}", "--port", "{port}"]
                .map(String::from)
                .to_vec(),
            default_log_dir: "logs".to_string(),
            default_port: 6006,
            default_host: "0.0.0.0".to_string(),
            connect_host: "127.0.0.1".to_string(),
            kill_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    /// Largest request body accepted for forwarding.
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load `path` (if present) and environment overrides on top of defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let prefix = env_prefix();
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(prefix.as_str())
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading config from {}", path.display()))?;

        let config: AppConfig = built.try_deserialize().context("parsing config")?;
        Ok(config)
    }

    /// Resolved transcript file path.
    pub fn transcript_path(&self) -> Result<PathBuf> {
        match &self.runner.transcript_path {
            Some(path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join(TRANSCRIPT_FILE_NAME)),
        }
    }
}

/// Write a commented default config to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}
