//! Lifecycle of the secondary metrics UI (TensorBoard by default).
//!
//! At most one instance runs. It is not restarted when it exits on its own;
//! the state simply falls back to `stopped`.

mod error;

pub use error::{VisualizerError, VisualizerResult};

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::VisualizerConfig;
use crate::process;

/// Lifecycle state of the visualizer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running { port: u16, log_dir: PathBuf },
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Parameters of one visualizer launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub log_dir: String,
    pub port: u16,
    pub host: String,
}

impl LaunchParams {
    pub fn from_config(config: &VisualizerConfig) -> Self {
        Self {
            log_dir: config.default_log_dir.clone(),
            port: config.default_port,
            host: config.default_host.clone(),
        }
    }

    /// Apply the set fields of `overrides` on top of `self`.
    pub fn merged(&self, overrides: LaunchOverrides) -> Self {
        Self {
            log_dir: overrides.log_dir.unwrap_or_else(|| self.log_dir.clone()),
            port: overrides.port.unwrap_or(self.port),
            host: overrides.host.unwrap_or_else(|| self.host.clone()),
        }
    }
}

/// Optional replacements for [`LaunchParams`] fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LaunchOverrides {
    #[serde(alias = "log_dir")]
    pub log_dir: Option<String>,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    pub host: Option<String>,
}

/// Accept a port as a number or a numeric string; blank means unset.
pub fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match Option::<PortValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortValue::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

/// Snapshot reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisualizerStatus {
    pub running: bool,
    pub state: &'static str,
    pub log_dir: String,
    pub port: u16,
    pub host: String,
    pub url: Option<String>,
}

struct Inner {
    state: ServiceState,
    params: LaunchParams,
    /// Bumped on every launch so a stale watcher cannot reset a newer one.
    generation: u64,
    watcher: Option<Watcher>,
}

struct Watcher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts, stops and monitors the visualizer child process.
pub struct VisualizerManager {
    config: VisualizerConfig,
    inner: Arc<Mutex<Inner>>,
    /// Serializes start/stop/restart.
    ops: tokio::sync::Mutex<()>,
}

impl VisualizerManager {
    pub fn new(config: VisualizerConfig) -> Self {
        let params = LaunchParams::from_config(&config);
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: ServiceState::Stopped,
                params,
                generation: 0,
                watcher: None,
            })),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    /// Parameters used when a request leaves fields unset.
    pub fn default_params(&self) -> LaunchParams {
        LaunchParams::from_config(&self.config)
    }

    /// Parameters of the current or last launch.
    pub fn params(&self) -> LaunchParams {
        self.lock().params.clone()
    }

    pub fn state(&self) -> ServiceState {
        self.lock().state.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock().state, ServiceState::Running { .. })
    }

    /// Base URL the proxy forwards to, while running.
    pub fn url(&self) -> Option<String> {
        match self.lock().state {
            ServiceState::Running { port, .. } => {
                Some(format!("http://{}:{}", self.config.connect_host, port))
            }
            _ => None,
        }
    }

    pub fn status(&self) -> VisualizerStatus {
        let inner = self.lock();
        let url = match inner.state {
            ServiceState::Running { port, .. } => {
                Some(format!("http://{}:{}", self.config.connect_host, port))
            }
            _ => None,
        };
        VisualizerStatus {
            running: matches!(inner.state, ServiceState::Running { .. }),
            state: inner.state.as_str(),
            log_dir: inner.params.log_dir.clone(),
            port: inner.params.port,
            host: inner.params.host.clone(),
            url,
        }
    }

    /// Launch the visualizer. Returns `Ok(false)` unless it was stopped.
    pub async fn start(&self, params: LaunchParams) -> VisualizerResult<bool> {
        let _ops = self.ops.lock().await;
        self.start_locked(params).await
    }

    /// Stop the visualizer. Returns `Ok(false)` when it was not running.
    pub async fn stop(&self) -> VisualizerResult<bool> {
        let _ops = self.ops.lock().await;
        Ok(self.stop_locked().await)
    }

    /// Stop, then start again with `overrides` applied to the last parameters.
    pub async fn restart(&self, overrides: LaunchOverrides) -> VisualizerResult<bool> {
        let _ops = self.ops.lock().await;
        self.stop_locked().await;
        let params = self.params().merged(overrides);
        self.start_locked(params).await
    }

    async fn start_locked(&self, params: LaunchParams) -> VisualizerResult<bool> {
        if params.log_dir.trim().is_empty() {
            return Err(VisualizerError::InvalidParams(
                "log directory is empty".to_string(),
            ));
        }

        let generation = {
            let mut inner = self.lock();
            if inner.state != ServiceState::Stopped {
                debug!("Visualizer start ignored in state {:?}", inner.state);
                return Ok(false);
            }
            inner.state = ServiceState::Starting;
            inner.params = params.clone();
            inner.generation += 1;
            inner.generation
        };

        let log_dir = PathBuf::from(&params.log_dir);
        if let Err(source) = tokio::fs::create_dir_all(&log_dir).await {
            self.lock().state = ServiceState::Stopped;
            return Err(VisualizerError::LogDir {
                path: log_dir,
                source,
            });
        }

        let child = match self.spawn_child(&params) {
            Ok(child) => child,
            Err(source) => {
                self.lock().state = ServiceState::Stopped;
                error!("Failed to start visualizer: {}", source);
                return Err(VisualizerError::Spawn {
                    binary: self.config.binary.clone(),
                    source,
                });
            }
        };
        info!(
            "Visualizer started (pid {:?}), log dir {}, port {}",
            child.id(),
            params.log_dir,
            params.port
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_child(
            child,
            generation,
            self.inner.clone(),
            cancel.clone(),
            Duration::from_secs(self.config.kill_grace_secs),
        ));

        let mut inner = self.lock();
        // The child may already have exited and been observed by the watcher.
        if inner.generation == generation && inner.state == ServiceState::Starting {
            inner.state = ServiceState::Running {
                port: params.port,
                log_dir,
            };
        }
        inner.watcher = Some(Watcher { cancel, task });
        Ok(true)
    }

    async fn stop_locked(&self) -> bool {
        let watcher = {
            let mut inner = self.lock();
            if inner.state == ServiceState::Stopped {
                inner.watcher = None;
                return false;
            }
            inner.state = ServiceState::Stopping;
            inner.watcher.take()
        };

        if let Some(watcher) = watcher {
            watcher.cancel.cancel();
            let limit = Duration::from_secs(self.config.kill_grace_secs + 5);
            if tokio::time::timeout(limit, watcher.task).await.is_err() {
                warn!("Visualizer did not stop within {:?}", limit);
            }
        }

        self.lock().state = ServiceState::Stopped;
        info!("Visualizer stopped");
        true
    }

    fn spawn_child(&self, params: &LaunchParams) -> std::io::Result<Child> {
        let args = render_args(&self.config.args, params);
        debug!("Spawning {} {:?}", self.config.binary, args);

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("visualizer: {}", line);
                }
            });
        }
        Ok(child)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Substitute `{log_dir}`, `{host}` and `{port}` in each template argument.
pub fn render_args(template: &[String], params: &LaunchParams) -> Vec<String> {
    let port = params.port.to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{log_dir}", &params.log_dir)
                .replace("{host}", &params.host)
                .replace("{port}", &port)
        })
        .collect()
}

async fn watch_child(
    mut child: Child,
    generation: u64,
    inner: Arc<Mutex<Inner>>,
    cancel: CancellationToken,
    kill_grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(
                    "Visualizer exited unexpectedly with code {}",
                    process::exit_code(status)
                ),
                Err(e) => error!("Failed to wait for visualizer: {}", e),
            }
            let mut inner = lock_inner(&inner);
            if inner.generation == generation {
                inner.state = ServiceState::Stopped;
            }
        }
        _ = cancel.cancelled() => {
            match process::shutdown_child(&mut child, kill_grace).await {
                Ok(status) => debug!("Visualizer exited with code {}", process::exit_code(status)),
                Err(e) => warn!("Error while stopping visualizer: {}", e),
            }
        }
    }
}
