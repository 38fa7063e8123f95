//! Host resource probes.
//!
//! Everything here blocks (the CPU reading sleeps for the settle delay, GPU
//! queries spawn a process), so probes are driven from the blocking pool.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, warn};
use sysinfo::{Disk, Disks, MINIMUM_CPU_UPDATE_INTERVAL, System};

use super::types::{
    GpuReading, HostCapacity, SAMPLE_TIME_FORMAT, TelemetrySample, bytes_to_gib, round2,
};
use crate::config::TelemetryConfig;

/// Arguments passed to `nvidia-smi` for a CSV utilization report.
const GPU_QUERY_ARGS: [&str; 2] = [
    "--query-gpu=utilization.gpu,memory.used,memory.total",
    "--format=csv,noheader,nounits",
];

/// Source of host resource readings.
///
/// Each reading fails on its own; callers decide how to degrade.
pub trait HostProbe: Send + 'static {
    /// Global CPU usage in percent.
    fn cpu_percent(&mut self) -> Result<f32>;

    /// Used memory in GiB.
    fn memory_used_gib(&mut self) -> Result<f64>;

    /// One reading per GPU. An empty list means no GPU is present.
    fn gpus(&mut self) -> Result<Vec<GpuReading>>;

    /// Free space of the watched disk in GiB.
    fn disk_free_gib(&mut self) -> Result<f64>;

    /// Static host sizes. Unknown values are zero.
    fn capacity(&mut self) -> HostCapacity;
}

/// Take one sample, replacing every failed reading with zero or empty.
pub fn collect_sample(probe: &mut dyn HostProbe) -> TelemetrySample {
    let cpu = probe.cpu_percent().unwrap_or_else(|e| {
        warn!("CPU reading failed: {:#}", e);
        0.0
    });
    let memory = probe.memory_used_gib().unwrap_or_else(|e| {
        warn!("Memory reading failed: {:#}", e);
        0.0
    });
    let gpus = probe.gpus().unwrap_or_else(|e| {
        debug!("GPU reading failed: {:#}", e);
        Vec::new()
    });
    let save_memory = probe.disk_free_gib().unwrap_or_else(|e| {
        warn!("Disk reading failed: {:#}", e);
        0.0
    });

    TelemetrySample {
        cpu,
        memory: round2(memory),
        gpu: gpus.iter().map(|g| g.load_percent).collect(),
        gpu_memory: gpus
            .iter()
            .map(|g| round2(g.memory_used_mib / 1024.0))
            .collect(),
        save_memory: round2(save_memory),
        time: chrono::Local::now().format(SAMPLE_TIME_FORMAT).to_string(),
    }
}

/// Probe backed by `sysinfo` and `nvidia-smi`.
pub struct SystemProbe {
    system: System,
    cpu_settle: Duration,
    disk_path: PathBuf,
    gpu_query_binary: Option<String>,
}

impl SystemProbe {
    pub fn new(
        cpu_settle: Duration,
        disk_path: impl Into<PathBuf>,
        gpu_query_binary: Option<String>,
    ) -> Self {
        Self {
            system: System::new(),
            cpu_settle: cpu_settle.max(MINIMUM_CPU_UPDATE_INTERVAL),
            disk_path: disk_path.into(),
            gpu_query_binary: gpu_query_binary.filter(|b| !b.trim().is_empty()),
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.cpu_settle_ms),
            &config.disk_path,
            Some(config.gpu_query_binary.clone()),
        )
    }

    fn watched_disk_space(&self) -> Result<(u64, u64)> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disk_for_path(disks.list(), &self.disk_path)
            .ok_or_else(|| anyhow!("no disk mounted at {}", self.disk_path.display()))?;
        Ok((disk.available_space(), disk.total_space()))
    }
}

impl HostProbe for SystemProbe {
    fn cpu_percent(&mut self) -> Result<f32> {
        // Usage is a delta between two refreshes.
        self.system.refresh_cpu_usage();
        std::thread::sleep(self.cpu_settle);
        self.system.refresh_cpu_usage();
        Ok(self.system.global_cpu_usage())
    }

    fn memory_used_gib(&mut self) -> Result<f64> {
        self.system.refresh_memory();
        if self.system.total_memory() == 0 {
            bail!("memory counters unavailable");
        }
        Ok(bytes_to_gib(self.system.used_memory()))
    }

    fn gpus(&mut self) -> Result<Vec<GpuReading>> {
        let Some(binary) = self.gpu_query_binary.as_deref() else {
            return Ok(Vec::new());
        };
        let output = Command::new(binary)
            .args(GPU_QUERY_ARGS)
            .output()
            .with_context(|| format!("running {binary}"))?;
        if !output.status.success() {
            bail!(
                "{binary} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_gpu_csv(&String::from_utf8_lossy(&output.stdout))
    }

    fn disk_free_gib(&mut self) -> Result<f64> {
        let (available, _) = self.watched_disk_space()?;
        Ok(bytes_to_gib(available))
    }

    fn capacity(&mut self) -> HostCapacity {
        self.system.refresh_memory();
        let max_memory = bytes_to_gib(self.system.total_memory()).ceil() as u64;

        let max_gpu_memory = match self.gpus() {
            Ok(gpus) => gpus
                .first()
                .map(|g| round2(g.memory_total_mib / 1024.0))
                .unwrap_or(0.0),
            Err(e) => {
                debug!("GPU capacity unavailable: {:#}", e);
                0.0
            }
        };

        let max_save_memory = match self.watched_disk_space() {
            Ok((_, total)) => round2(bytes_to_gib(total)),
            Err(e) => {
                warn!("Disk capacity unavailable: {:#}", e);
                0.0
            }
        };

        HostCapacity {
            max_memory,
            max_gpu_memory,
            max_save_memory,
        }
    }
}

/// The disk whose mount point is the longest prefix of `path`.
fn disk_for_path<'a>(disks: &'a [Disk], path: &Path) -> Option<&'a Disk> {
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
}

/// Parse `utilization, used MiB, total MiB` rows, one per GPU.
pub fn parse_gpu_csv(output: &str) -> Result<Vec<GpuReading>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [load, used, total] = fields.as_slice() else {
                bail!("unexpected GPU row: {line:?}");
            };
            Ok(GpuReading {
                load_percent: parse_field(load)?,
                memory_used_mib: parse_field(used)?,
                memory_total_mib: parse_field(total)?,
            })
        })
        .collect()
}

fn parse_field(field: &str) -> Result<f64> {
    field
        .parse::<f64>()
        .with_context(|| format!("invalid GPU value {field:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenProbe;

    impl HostProbe for BrokenProbe {
        fn cpu_percent(&mut self) -> Result<f32> {
            Ok(12.5)
        }
        fn memory_used_gib(&mut self) -> Result<f64> {
            Ok(3.14159)
        }
        fn gpus(&mut self) -> Result<Vec<GpuReading>> {
            bail!("nvidia-smi: not found")
        }
        fn disk_free_gib(&mut self) -> Result<f64> {
            bail!("no disk")
        }
        fn capacity(&mut self) -> HostCapacity {
            HostCapacity::default()
        }
    }

    #[test]
    fn test_parse_gpu_csv() {
        let gpus = parse_gpu_csv("35, 2048, 8192\n 0, 0, 24576 \n\n").unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].load_percent, 35.0);
        assert_eq!(gpus[0].memory_used_mib, 2048.0);
        assert_eq!(gpus[1].memory_total_mib, 24576.0);
    }

    #[test]
    fn test_parse_gpu_csv_rejects_garbage() {
        assert!(parse_gpu_csv("35, 2048").is_err());
        assert!(parse_gpu_csv("[N/A], 1, 2").is_err());
        assert!(parse_gpu_csv("").unwrap().is_empty());
    }

    #[test]
    fn test_failed_readings_degrade_independently() {
        let sample = collect_sample(&mut BrokenProbe);
        assert_eq!(sample.cpu, 12.5);
        assert_eq!(sample.memory, 3.14);
        assert!(sample.gpu.is_empty());
        assert!(sample.gpu_memory.is_empty());
        assert_eq!(sample.save_memory, 0.0);
        assert_eq!(sample.time.len(), "2024-01-01 00:00:00".len());
    }

    #[test]
    fn test_missing_gpu_binary_reports_no_gpus() {
        let mut probe = SystemProbe::new(
            Duration::ZERO,
            "/",
            Some("runwatch-no-such-gpu-tool".to_string()),
        );
        assert!(probe.gpus().is_err());

        let mut disabled = SystemProbe::new(Duration::ZERO, "/", Some(String::new()));
        assert!(disabled.gpus().unwrap().is_empty());
    }
}
