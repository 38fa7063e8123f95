//! Host telemetry: probes, bounded history and the sampling loop.

mod history;
mod probe;
mod sampler;
mod types;

pub use history::{DEFAULT_CAPACITY, TelemetryHistory};
pub use probe::{HostProbe, SystemProbe, collect_sample, parse_gpu_csv};
pub use sampler::TelemetrySampler;
pub use types::{GpuReading, HostCapacity, TelemetrySample};
