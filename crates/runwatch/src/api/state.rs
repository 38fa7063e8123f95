//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::AppConfig;
use crate::runner::{ProcessRunner, RunnerOptions};
use crate::telemetry::{SystemProbe, TelemetryHistory, TelemetrySampler};
use crate::transcript::TranscriptStore;
use crate::visualizer::VisualizerManager;
use crate::ws::BroadcastHub;

use super::proxy::ProxyForwarder;

/// Default limit for proxied request bodies.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<ProcessRunner>,
    pub hub: Arc<BroadcastHub>,
    pub sampler: Arc<TelemetrySampler>,
    pub visualizer: Arc<VisualizerManager>,
    pub proxy: Arc<ProxyForwarder>,
    /// Largest request body accepted by the proxy routes.
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        runner: Arc<ProcessRunner>,
        hub: Arc<BroadcastHub>,
        sampler: Arc<TelemetrySampler>,
        visualizer: Arc<VisualizerManager>,
        proxy: Arc<ProxyForwarder>,
    ) -> Self {
        Self {
            runner,
            hub,
            sampler,
            visualizer,
            proxy,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Wire up every service from configuration. Nothing is started yet.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let transcript_path = config.transcript_path()?;
        let transcript = TranscriptStore::open(&transcript_path)
            .with_context(|| format!("opening transcript {}", transcript_path.display()))?;
        let history = TelemetryHistory::new(config.telemetry.capacity);
        let hub = Arc::new(BroadcastHub::new(Arc::new(transcript), Arc::new(history)));

        let runner = Arc::new(ProcessRunner::new(
            hub.clone(),
            RunnerOptions::from_config(&config.runner),
        ));
        let sampler = Arc::new(TelemetrySampler::new(
            hub.clone(),
            Box::new(SystemProbe::from_config(&config.telemetry)),
            Duration::from_millis(config.telemetry.period_ms),
        ));
        let visualizer = Arc::new(VisualizerManager::new(config.visualizer.clone()));
        let proxy = Arc::new(
            ProxyForwarder::new(
                visualizer.clone(),
                Duration::from_secs(config.proxy.timeout_secs),
            )
            .context("creating proxy client")?,
        );

        Ok(Self::new(runner, hub, sampler, visualizer, proxy)
            .with_max_body_bytes(config.proxy.max_body_bytes))
    }

    /// Stop the run, the sampler and the visualizer.
    pub async fn shutdown(&self) {
        match self.runner.stop().await {
            Ok(true) => info!("Stopped active run"),
            Ok(false) => {}
            Err(e) => warn!("Failed to stop run: {}", e),
        }
        self.sampler.stop_monitoring().await;
        if let Err(e) = self.visualizer.stop().await {
            warn!("Failed to stop visualizer: {}", e);
        }
    }
}
