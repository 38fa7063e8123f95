//! Bounded telemetry history.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::types::TelemetrySample;

/// Number of samples kept when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 21;

/// Fixed-capacity FIFO of telemetry samples.
///
/// Samples are stored and copied whole under a lock, so readers never see a
/// partially written sample.
#[derive(Debug)]
pub struct TelemetryHistory {
    capacity: usize,
    samples: Mutex<VecDeque<TelemetrySample>>,
}

impl TelemetryHistory {
    /// Create an empty history. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample, evicting the oldest one when full.
    pub fn push(&self, sample: TelemetrySample) {
        let mut samples = self.lock();
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Copy of the buffered samples, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetrySample> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TelemetrySample>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TelemetryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
