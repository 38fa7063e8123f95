//! Telemetry data types.

use serde::{Deserialize, Serialize};

/// Timestamp format used in samples.
pub const SAMPLE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A point-in-time reading of host resources.
///
/// Field names match what dashboard clients chart: `memory`, `gpu_memory` and
/// `save_memory` are GiB, `cpu` and `gpu` are percentages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Global CPU usage in percent.
    pub cpu: f32,
    /// Used memory in GiB.
    pub memory: f64,
    /// Load per GPU in percent. Empty when no GPU could be read.
    pub gpu: Vec<f64>,
    /// Used memory per GPU in GiB.
    pub gpu_memory: Vec<f64>,
    /// Free disk space in GiB.
    pub save_memory: f64,
    /// Local time of the reading.
    pub time: String,
}

/// One GPU as reported by the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuReading {
    /// Utilization in percent.
    pub load_percent: f64,
    pub memory_used_mib: f64,
    pub memory_total_mib: f64,
}

/// Static host sizes used to scale dashboard charts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    /// Total memory in GiB, rounded up.
    pub max_memory: u64,
    /// Total memory of the first GPU in GiB, 0 without GPU.
    pub max_gpu_memory: f64,
    /// Total disk size in GiB.
    pub max_save_memory: f64,
}

/// Round to two decimals, the precision shown on the dashboard.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}
