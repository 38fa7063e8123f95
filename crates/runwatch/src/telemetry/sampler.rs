//! Periodic telemetry sampling loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::probe::{HostProbe, collect_sample};
use super::types::{HostCapacity, TelemetrySample};
use crate::ws::{BroadcastHub, HubEvent};

type SharedProbe = Arc<Mutex<Box<dyn HostProbe>>>;

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Samples the host on a fixed period and publishes each reading to the hub.
///
/// The hub records samples into its bounded history, so late subscribers
/// get the most recent window replayed.
pub struct TelemetrySampler {
    hub: Arc<BroadcastHub>,
    probe: SharedProbe,
    period: Duration,
    running: Mutex<Option<LoopHandle>>,
}

impl TelemetrySampler {
    pub fn new(hub: Arc<BroadcastHub>, probe: Box<dyn HostProbe>, period: Duration) -> Self {
        Self {
            hub,
            probe: Arc::new(Mutex::new(probe)),
            period: period.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    /// Start the sampling loop. Returns `false` when it is already running.
    pub fn start_monitoring(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sample_loop(
            self.hub.clone(),
            self.probe.clone(),
            self.period,
            cancel.clone(),
        ));
        *running = Some(LoopHandle { cancel, task });
        info!("Telemetry sampling started (period {:?})", self.period);
        true
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// A probe that is mid-reading keeps running on the blocking pool; its
    /// result is discarded.
    pub async fn stop_monitoring(&self) -> bool {
        let handle = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return false;
        };

        handle.cancel.cancel();
        match tokio::time::timeout(self.period, handle.task).await {
            Ok(_) => info!("Telemetry sampling stopped"),
            Err(_) => warn!("Telemetry loop did not stop within {:?}", self.period),
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Buffered samples, oldest first.
    pub fn history(&self) -> Vec<TelemetrySample> {
        self.hub.telemetry().snapshot()
    }

    /// Static host sizes from the probe.
    pub async fn host_capacity(&self) -> HostCapacity {
        let probe = self.probe.clone();
        tokio::task::spawn_blocking(move || {
            let mut probe = probe.lock().unwrap_or_else(|e| e.into_inner());
            probe.capacity()
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Host capacity probe failed: {}", e);
            HostCapacity::default()
        })
    }
}

async fn sample_loop(
    hub: Arc<BroadcastHub>,
    probe: SharedProbe,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let probe = probe.clone();
        let reading = tokio::task::spawn_blocking(move || {
            let mut probe = probe.lock().unwrap_or_else(|e| e.into_inner());
            collect_sample(probe.as_mut())
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reading => result,
        };
        match result {
            Ok(sample) => hub.publish(HubEvent::Telemetry(sample)),
            // A panicking probe costs one tick.
            Err(e) => warn!("Telemetry tick failed: {}", e),
        }
    }
    debug!("Telemetry loop exited");
}
